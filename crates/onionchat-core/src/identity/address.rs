//! Peer addresses exchanged out of band.
//!
//! Wire form is 76 uppercase hex characters:
//!
//! ```text
//! public key (32 bytes) | nospam (4 bytes) | checksum (2 bytes)
//! ```
//!
//! The checksum XORs the preceding 36 bytes pairwise into two bytes.

use crate::error::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Length of the anti-spam nonce in bytes.
pub const NOSPAM_SIZE: usize = 4;

/// Length of the address checksum in bytes.
pub const CHECKSUM_SIZE: usize = 2;

/// Length of a full address in bytes.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// Length of a public key in hex characters.
pub const PUBLIC_KEY_HEX_LEN: usize = PUBLIC_KEY_SIZE * 2;

/// Length of a full address in hex characters.
pub const ADDRESS_HEX_LEN: usize = ADDRESS_SIZE * 2;

/// A peer's long-term public key, the primary key of the friend table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex public key (either case).
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != PUBLIC_KEY_HEX_LEN {
            return Err(Error::InvalidKey(format!(
                "public key must be {} hex characters",
                PUBLIC_KEY_HEX_LEN
            )));
        }
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Uppercase hex form used by every public-facing API.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "PublicKey({}...{})", &hex[..4], &hex[hex.len() - 4..])
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Anti-spam nonce embedded in an address.
///
/// Friend requests must echo it back; requests carrying a different value
/// are dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nospam([u8; NOSPAM_SIZE]);

impl Nospam {
    /// Generate a random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NOSPAM_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; NOSPAM_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; NOSPAM_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Nospam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nospam({})", hex::encode_upper(self.0))
    }
}

/// A full, checksum-validated peer address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    public_key: PublicKey,
    nospam: Nospam,
}

impl PeerAddress {
    /// Build an address from its parts.
    pub fn new(public_key: PublicKey, nospam: Nospam) -> Self {
        Self { public_key, nospam }
    }

    /// Parse and validate a 76-character hex address.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != ADDRESS_HEX_LEN {
            return Err(Error::InvalidAddress(format!(
                "address must be {} hex characters, got {}",
                ADDRESS_HEX_LEN,
                s.len()
            )));
        }

        let mut bytes = [0u8; ADDRESS_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::InvalidAddress(format!("not hex: {}", e)))?;

        let body = &bytes[..PUBLIC_KEY_SIZE + NOSPAM_SIZE];
        if checksum(body) != bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..] {
            return Err(Error::InvalidAddress("checksum mismatch".into()));
        }

        let mut pk = [0u8; PUBLIC_KEY_SIZE];
        pk.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);

        Ok(Self {
            public_key: PublicKey(pk),
            nospam: Nospam(nospam),
        })
    }

    /// The long-term identity part.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The anti-spam part.
    pub fn nospam(&self) -> &Nospam {
        &self.nospam
    }

    /// Raw 38-byte form including the checksum.
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key.0);
        bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE].copy_from_slice(&self.nospam.0);
        let sum = checksum(&bytes[..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&sum);
        bytes
    }

    /// Uppercase hex form shared with other users.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.to_bytes())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerAddress")
            .field("public_key", &self.public_key)
            .field("nospam", &self.nospam)
            .finish()
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Pairwise XOR checksum over the address body.
fn checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut sum = [0u8; CHECKSUM_SIZE];
    for (i, byte) in body.iter().enumerate() {
        sum[i % CHECKSUM_SIZE] ^= byte;
    }
    sum
}

/// Extract the public-key part of an address string.
///
/// Returns the first 64 characters exactly as given when the address is
/// well formed, and `None` for the wrong length, non-hex input or a bad
/// checksum.
pub fn public_key_from_address(address: &str) -> Option<String> {
    PeerAddress::parse(address).ok()?;
    address.get(..PUBLIC_KEY_HEX_LEN).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_address() -> PeerAddress {
        PeerAddress::new(
            PublicKey::from_bytes([0xAB; PUBLIC_KEY_SIZE]),
            Nospam::from_bytes([1, 2, 3, 4]),
        )
    }

    #[test]
    fn test_address_format() {
        let addr = sample_address();
        let hex = addr.to_hex();
        assert_eq!(hex.len(), ADDRESS_HEX_LEN);
        assert!(hex.starts_with(&"AB".repeat(32)));
        assert_eq!(&hex[64..72], "01020304");
        assert_eq!(hex, hex.to_uppercase());
    }

    #[test]
    fn test_checksum_is_pairwise_xor() {
        // 32 x 0xAB cancels out in both lanes, leaving 01^03 and 02^04.
        let addr = sample_address();
        let bytes = addr.to_bytes();
        assert_eq!(bytes[36], 0x01 ^ 0x03);
        assert_eq!(bytes[37], 0x02 ^ 0x04);
    }

    #[test]
    fn test_parse_accepts_lowercase() {
        let addr = sample_address();
        let parsed = PeerAddress::parse(&addr.to_hex().to_lowercase()).expect("should parse");
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_public_key_from_address() {
        let hex = sample_address().to_hex();
        assert_eq!(public_key_from_address(&hex), Some(hex[..64].to_string()));

        let lower = hex.to_lowercase();
        assert_eq!(public_key_from_address(&lower), Some(lower[..64].to_string()));
    }

    #[test]
    fn test_public_key_from_address_rejects() {
        let hex = sample_address().to_hex();

        assert_eq!(public_key_from_address(&hex[..75]), None);
        assert_eq!(public_key_from_address(&format!("{}0", hex)), None);

        let mut bad_hex = hex.clone();
        bad_hex.replace_range(0..1, "Z");
        assert_eq!(public_key_from_address(&bad_hex), None);

        let mut bad_sum = hex.clone();
        let last = if hex.ends_with('0') { "1" } else { "0" };
        bad_sum.replace_range(75..76, last);
        assert_eq!(public_key_from_address(&bad_sum), None);
    }

    #[test]
    fn test_public_key_hex() {
        let key = PublicKey::from_bytes([0x0F; 32]);
        assert_eq!(key.to_hex(), "0F".repeat(32));
        assert_eq!(PublicKey::from_hex(&key.to_hex().to_lowercase()).expect("hex"), key);
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_debug_abbreviates_key() {
        let key = PublicKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{:?}", key), "PublicKey(ABAB...ABAB)");
        assert_eq!(key.to_string(), key.to_hex());
    }
}
