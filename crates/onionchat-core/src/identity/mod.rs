//! Identity management.
//!
//! Two identifiers exist for every node, both derived from one Ed25519 key:
//!
//! - the [`PeerAddress`]: 76 hex characters shared out of band, made of the
//!   public key, an anti-spam nonce and a checksum
//! - the [`OnionAddress`]: the Tor v3 hidden service the node listens on
//!
//! A peer's onion address is computed from its public key, so knowing the
//! public key is enough to reach it.

mod address;
mod onion;

pub use address::{
    public_key_from_address, Nospam, PeerAddress, PublicKey, ADDRESS_HEX_LEN, PUBLIC_KEY_HEX_LEN,
};
pub use onion::{OnionAddress, OnionIdentity, TOR_KEY_PREFIX};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_and_onion_share_key() {
        let identity = OnionIdentity::generate();
        let address = PeerAddress::new(identity.public_key(), Nospam::generate());
        let parsed = PeerAddress::parse(&address.to_hex()).expect("should parse");
        assert_eq!(
            &OnionAddress::for_peer(parsed.public_key()),
            identity.onion_address()
        );
    }
}
