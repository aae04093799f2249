//! Peer wire protocol.
//!
//! A strict binary, versioned protocol transmitted over Tor TCP streams.
//! Tor already encrypts the stream end to end up to the onion service, so
//! payloads are plain bincode. The first exchange on every stream is an
//! Ed25519-signed handshake that binds the stream to a peer public key.
//!
//! ## Protocol Rules
//!
//! - Strict packet validation
//! - Silent drop on malformed input (no error responses)
//! - Versioned for forward compatibility
//! - Binary format (not JSON/text)
//!
//! ## Packet Structure
//!
//! ```text
//! ┌─────────┬─────────┬──────────┬───────────────────┐
//! │ Version │  Type   │  Length  │     Payload       │
//! │ (1 byte)│ (1 byte)│ (4 bytes)│   (variable)      │
//! └─────────┴─────────┴──────────┴───────────────────┘
//! ```
//!
//! Maximum payload size: 64 KiB

mod packet;
mod types;

pub use packet::{read_packet, write_packet, Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use types::{
    handshake_transcript, FileChunkPayload, FileChunkRequestPayload, FileControl,
    FileControlPayload, FileOfferPayload, FriendAcceptPayload, FriendRequestPayload,
    HelloAckPayload, HelloPayload, MessagePayload, PacketType, Payload, PeerPacket,
    ReceiptPayload, StatusPayload, TypingPayload,
};

use crate::error::{Error, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum supported protocol version.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Validate that a protocol version is supported.
pub fn validate_version(version: u8) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(Error::Protocol(format!(
            "unsupported protocol version: {}",
            version
        )));
    }
    Ok(())
}
