//! Tor v3 onion address derivation and the Ed25519 identity behind it.
//!
//! Tor v3 (.onion) addresses are derived from Ed25519 public keys:
//!
//! 1. Compute checksum: SHA3-256(".onion checksum" || pubkey || version)[..2]
//! 2. Encode: base32(pubkey || checksum || version)
//! 3. Append ".onion"
//!
//! This produces a 56-character address + ".onion" suffix.

use super::address::PublicKey;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use sha3::Sha3_256;
use std::fmt;
use zeroize::Zeroizing;

/// Tor v3 onion service version byte.
const ONION_VERSION: u8 = 0x03;

/// Checksum prefix per Tor spec.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Key-type prefix Tor uses for v3 service keys on the control port.
pub const TOR_KEY_PREFIX: &str = "ED25519-V3:";

/// A Tor v3 onion address.
///
/// Format: `<56 base32 chars>.onion`
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse and validate an onion address string.
    ///
    /// A bare 56-character hostname is accepted and gets the suffix appended.
    /// The embedded checksum, version byte and Ed25519 point are all checked.
    pub fn from_string(s: impl Into<String>) -> Result<Self> {
        let mut s = s.into().trim().to_lowercase();
        if !s.ends_with(".onion") {
            s.push_str(".onion");
        }

        let addr_part = &s[..s.len() - 6];
        if addr_part.len() != 56 {
            return Err(Error::InvalidAddress("v3 address must be 56 characters".into()));
        }
        decode_hostname(addr_part)?;

        Ok(Self(s))
    }

    /// Get the full address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get just the hostname (without .onion suffix).
    pub fn hostname(&self) -> &str {
        &self.0[..56]
    }

    /// Derive an onion address from an Ed25519 public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        Self::from_key_bytes(public_key.as_bytes())
    }

    /// Derive the onion address a peer publishes for its public key.
    pub fn for_peer(public_key: &PublicKey) -> Self {
        Self::from_key_bytes(public_key.as_bytes())
    }

    fn from_key_bytes(pubkey_bytes: &[u8; 32]) -> Self {
        let checksum = onion_checksum(pubkey_bytes);

        // pubkey (32) || checksum (2) || version (1)
        let mut addr_bytes = [0u8; 35];
        addr_bytes[..32].copy_from_slice(pubkey_bytes);
        addr_bytes[32..34].copy_from_slice(&checksum);
        addr_bytes[34] = ONION_VERSION;

        let encoded = base32::encode(base32::Alphabet::RFC4648 { padding: false }, &addr_bytes);

        Self(format!("{}.onion", encoded.to_lowercase()))
    }
}

/// Decode a 56-character hostname back to the service's public key.
fn decode_hostname(hostname: &str) -> Result<VerifyingKey> {
    let decoded = base32::decode(
        base32::Alphabet::RFC4648 { padding: false },
        &hostname.to_uppercase(),
    )
    .ok_or_else(|| Error::InvalidAddress("invalid base32 encoding".into()))?;

    // pubkey (32) || checksum (2) || version (1)
    let [key @ .., c0, c1, version]: [u8; 35] = decoded
        .try_into()
        .map_err(|_| Error::InvalidAddress("invalid address length".into()))?;
    if version != ONION_VERSION {
        return Err(Error::InvalidAddress("unsupported onion version".into()));
    }
    if [c0, c1] != onion_checksum(&key) {
        return Err(Error::InvalidAddress("checksum mismatch".into()));
    }

    VerifyingKey::from_bytes(&key)
        .map_err(|e| Error::InvalidKey(format!("invalid public key: {}", e)))
}

fn onion_checksum(pubkey_bytes: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey_bytes);
    hasher.update([ONION_VERSION]);
    let hash = hasher.finalize();
    [hash[0], hash[1]]
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}

/// An Ed25519 keypair together with the onion address it publishes.
///
/// Used both for the transport's hidden service and for the engine's peer
/// identity. The signing key zeroizes itself on drop.
pub struct OnionIdentity {
    signing_key: SigningKey,
    onion_address: OnionAddress,
}

impl OnionIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Create identity from an Ed25519 signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let onion_address = OnionAddress::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            onion_address,
        }
    }

    /// Restore identity from the 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("secret key must be 32 bytes".into()))?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret_bytes)))
    }

    /// Get this identity's onion address.
    pub fn onion_address(&self) -> &OnionAddress {
        &self.onion_address
    }

    /// Get the Ed25519 verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the public key in peer-address form.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature against a peer public key.
    pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(public_key.as_bytes())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        key.verify(message, signature)
            .map_err(|_| Error::Protocol("signature verification failed".into()))
    }

    /// Export the secret seed.
    ///
    /// The returned buffer is zeroized on drop; never log it.
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// The key blob Tor's `ADD_ONION` expects: `ED25519-V3:<base64 expanded key>`.
    pub fn tor_private_key(&self) -> Zeroizing<String> {
        let expanded = expand_ed25519_secret_key(&self.signing_key.to_bytes());
        Zeroizing::new(format!("{}{}", TOR_KEY_PREFIX, BASE64.encode(&expanded[..])))
    }
}

impl fmt::Debug for OnionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionIdentity")
            .field("onion_address", &self.onion_address)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl Clone for OnionIdentity {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
            onion_address: self.onion_address.clone(),
        }
    }
}

/// Expand an Ed25519 32-byte seed to Tor's 64-byte expanded secret key.
///
/// First 32 bytes: clamped scalar. Last 32 bytes: signing prefix.
fn expand_ed25519_secret_key(seed: &[u8; 32]) -> Zeroizing<[u8; 64]> {
    let hash = Sha512::digest(seed);
    let mut expanded = Zeroizing::new([0u8; 64]);
    expanded.copy_from_slice(&hash);

    expanded[0] &= 248;
    expanded[31] &= 127;
    expanded[31] |= 64;

    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onion_address_derivation() {
        let identity = OnionIdentity::generate();
        let onion = identity.onion_address();

        assert!(onion.as_str().ends_with(".onion"));
        assert_eq!(onion.as_str().len(), 62);

        let decoded = decode_hostname(onion.hostname()).expect("should decode");
        assert_eq!(decoded, identity.verifying_key());
    }

    #[test]
    fn test_peer_key_maps_to_same_onion() {
        let identity = OnionIdentity::generate();
        let via_peer = OnionAddress::for_peer(&identity.public_key());
        assert_eq!(&via_peer, identity.onion_address());
    }

    #[test]
    fn test_onion_address_validation() {
        assert!(OnionAddress::from_string("abc.com").is_err());
        assert!(OnionAddress::from_string("abc.onion").is_err());
        assert!(OnionAddress::from_string(
            "0000000000000000000000000000000000000000000000000000000.onion"
        )
        .is_err());

        // Right length and alphabet, wrong checksum.
        let key = OnionIdentity::generate().verifying_key();
        let checksum = onion_checksum(key.as_bytes());
        let mut bytes = [0u8; 35];
        bytes[..32].copy_from_slice(key.as_bytes());
        bytes[32] = !checksum[0];
        bytes[33] = checksum[1];
        bytes[34] = ONION_VERSION;
        let tampered = base32::encode(base32::Alphabet::RFC4648 { padding: false }, &bytes);
        assert!(matches!(
            OnionAddress::from_string(tampered),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_bare_hostname_and_case() {
        let identity = OnionIdentity::generate();
        let onion = identity.onion_address();

        let parsed = OnionAddress::from_string(onion.hostname().to_uppercase()).expect("should parse");
        assert_eq!(&parsed, onion);
    }

    #[test]
    fn test_identity_persistence() {
        let id1 = OnionIdentity::generate();
        let id2 = OnionIdentity::from_secret_bytes(&id1.secret_key_bytes()[..]).expect("should restore");
        assert_eq!(id1.onion_address(), id2.onion_address());
        assert!(OnionIdentity::from_secret_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn test_signing_verification() {
        let identity = OnionIdentity::generate();
        let signature = identity.sign(b"hello");

        assert!(OnionIdentity::verify(&identity.public_key(), b"hello", &signature).is_ok());
        assert!(OnionIdentity::verify(&identity.public_key(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_tor_private_key_format() {
        let identity = OnionIdentity::generate();
        let key = identity.tor_private_key();
        assert!(key.starts_with(TOR_KEY_PREFIX));
        let decoded = BASE64.decode(&key[TOR_KEY_PREFIX.len()..]).expect("base64");
        assert_eq!(decoded.len(), 64);
    }

    #[test]
    fn test_expand_secret_key() {
        let expanded = expand_ed25519_secret_key(&[0u8; 32]);
        assert_eq!(expanded[0] & 7, 0);
        assert_eq!(expanded[31] & 128, 0);
        assert_eq!(expanded[31] & 64, 64);
    }
}
