//! Persisted engine state.
//!
//! The blob is bincode, Base64-encoded (standard alphabet, padded). It holds
//! the secret seed, so callers must store it like a private key.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Current blob format version.
pub const STATE_VERSION: u8 = 1;

/// A saved friend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedFriend {
    /// Public key.
    pub public_key: [u8; 32],
    /// Friend number.
    pub friend_number: u32,
    /// `true` once the friend accepted.
    pub established: bool,
    /// Pending outbound request as `(nospam, message)`.
    pub request: Option<([u8; 4], String)>,
}

/// A saved inbound friend request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRequest {
    /// Requester.
    pub public_key: [u8; 32],
    /// Request text.
    pub message: String,
}

/// Everything needed to rebuild an engine.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    /// Format version.
    pub version: u8,
    /// Ed25519 seed.
    pub secret_key: [u8; 32],
    /// Anti-spam nonce.
    pub nospam: [u8; 4],
    /// Friend table.
    pub friends: Vec<SavedFriend>,
    /// Inbound requests not yet confirmed.
    pub pending_requests: Vec<SavedRequest>,
}

impl SavedState {
    /// Encode to the opaque Base64 string.
    pub fn encode(&self) -> Result<String> {
        let mut bytes = bincode::serialize(self)?;
        let encoded = BASE64.encode(&bytes);
        bytes.zeroize();
        Ok(encoded)
    }

    /// Decode and validate a blob produced by [`SavedState::encode`].
    pub fn decode(blob: &str) -> Result<Self> {
        let mut bytes = BASE64
            .decode(blob.trim())
            .map_err(|e| Error::InvalidState(format!("not base64: {}", e)))?;
        let decoded: std::result::Result<Self, _> = bincode::deserialize(&bytes);
        bytes.zeroize();
        let state = decoded.map_err(|e| Error::InvalidState(format!("undecodable: {}", e)))?;

        if state.version != STATE_VERSION {
            return Err(Error::InvalidState(format!(
                "unsupported state version {}",
                state.version
            )));
        }

        let mut numbers = std::collections::HashSet::new();
        let mut keys = std::collections::HashSet::new();
        for friend in &state.friends {
            if !numbers.insert(friend.friend_number) || !keys.insert(friend.public_key) {
                return Err(Error::InvalidState("duplicate friend entry".into()));
            }
        }

        Ok(state)
    }
}

impl std::fmt::Debug for SavedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedState")
            .field("version", &self.version)
            .field("secret_key", &"[REDACTED]")
            .field("friends", &self.friends.len())
            .field("pending_requests", &self.pending_requests.len())
            .finish()
    }
}

impl Drop for SavedState {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SavedState {
        SavedState {
            version: STATE_VERSION,
            secret_key: [7; 32],
            nospam: [1, 2, 3, 4],
            friends: vec![
                SavedFriend {
                    public_key: [1; 32],
                    friend_number: 0,
                    established: true,
                    request: None,
                },
                SavedFriend {
                    public_key: [2; 32],
                    friend_number: 1,
                    established: false,
                    request: Some(([9, 9, 9, 9], "hi".into())),
                },
            ],
            pending_requests: vec![SavedRequest {
                public_key: [3; 32],
                message: "{\"name\":\"bob\"}".into(),
            }],
        }
    }

    #[test]
    fn test_blob_restores_friends() {
        let blob = sample().encode().expect("encode");
        assert_eq!(SavedState::decode(&blob).expect("decode"), sample());
    }

    #[test]
    fn test_malformed_blobs() {
        assert!(matches!(SavedState::decode("!!!"), Err(Error::InvalidState(_))));
        assert!(matches!(
            SavedState::decode(&BASE64.encode([1u8, 2, 3])),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_version_and_duplicates_rejected() {
        let mut future = sample();
        future.version = STATE_VERSION + 1;
        assert!(SavedState::decode(&future.encode().expect("encode")).is_err());

        let mut dup = sample();
        dup.friends[1].friend_number = 0;
        assert!(SavedState::decode(&dup.encode().expect("encode")).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        assert!(!format!("{:?}", sample()).contains("7, 7"));
    }
}
