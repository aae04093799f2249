//! Packet types and payload definitions.

use super::packet::Packet;
use crate::error::{Error, Result};
use crate::messaging::MessageKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serde helper for [u8; 64] arrays (signatures).
mod serde_signature {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bytes.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec: Vec<u8> = Vec::deserialize(deserializer)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("invalid signature length"))
    }
}

/// Packet type discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Handshake opener from the connecting side.
    Hello = 0x01,
    /// Handshake reply from the accepting side.
    HelloAck = 0x02,
    /// Friend request carrying the anti-spam nonce and a message.
    FriendRequest = 0x10,
    /// Acceptance of a friend request.
    FriendAccept = 0x11,
    /// Chat message.
    Message = 0x20,
    /// Read receipt.
    Receipt = 0x21,
    /// Typing indicator.
    Typing = 0x22,
    /// Online presence.
    Status = 0x23,
    /// File transfer offer.
    FileOffer = 0x30,
    /// File transfer control (accept, cancel, complete).
    FileControl = 0x31,
    /// Receiver asks for one chunk.
    FileChunkRequest = 0x32,
    /// One chunk of file data.
    FileChunk = 0x33,
}

impl PacketType {
    /// Parse packet type from byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x10 => Ok(Self::FriendRequest),
            0x11 => Ok(Self::FriendAccept),
            0x20 => Ok(Self::Message),
            0x21 => Ok(Self::Receipt),
            0x22 => Ok(Self::Typing),
            0x23 => Ok(Self::Status),
            0x30 => Ok(Self::FileOffer),
            0x31 => Ok(Self::FileControl),
            0x32 => Ok(Self::FileChunkRequest),
            0x33 => Ok(Self::FileChunk),
            _ => Err(Error::Protocol(format!("unknown packet type: {:#04x}", byte))),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A bincode payload bound to one packet type.
pub trait Payload: Serialize + DeserializeOwned {
    /// The packet type this payload travels in.
    const PACKET_TYPE: PacketType;

    /// Serialize to bytes.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Frame as a packet.
    fn to_packet(&self) -> Result<Packet> {
        Packet::new(Self::PACKET_TYPE, self.to_bytes()?)
    }
}

/// Domain separator for handshake signatures.
const HANDSHAKE_CONTEXT: &[u8] = b"onionchat-handshake-v1";

/// Bytes signed during the handshake.
///
/// Both sides sign the same transcript under a different role label, so a
/// signature from one direction cannot be replayed in the other.
pub fn handshake_transcript(
    role: &str,
    initiator: &[u8; 32],
    responder: &[u8; 32],
    nonce: &[u8; 32],
    timestamp: i64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_CONTEXT.len() + role.len() + 32 * 3 + 8);
    out.extend_from_slice(HANDSHAKE_CONTEXT);
    out.extend_from_slice(role.as_bytes());
    out.extend_from_slice(initiator);
    out.extend_from_slice(responder);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out
}

/// HELLO payload.
///
/// The connecting side proves ownership of its public key and names the
/// peer it expects to reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Sender's Ed25519 public key.
    pub public_key: [u8; 32],
    /// Public key the sender believes it connected to.
    pub target: [u8; 32],
    /// Fresh random nonce.
    pub nonce: [u8; 32],
    /// Unix seconds.
    pub timestamp: i64,
    /// Signature over the `hello` transcript.
    #[serde(with = "serde_signature")]
    pub signature: [u8; 64],
}

impl Payload for HelloPayload {
    const PACKET_TYPE: PacketType = PacketType::Hello;
}

/// HELLO_ACK payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    /// Responder's Ed25519 public key.
    pub public_key: [u8; 32],
    /// Signature over the `ack` transcript.
    #[serde(with = "serde_signature")]
    pub signature: [u8; 64],
}

impl Payload for HelloAckPayload {
    const PACKET_TYPE: PacketType = PacketType::HelloAck;
}

/// FRIEND_REQUEST payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestPayload {
    /// Anti-spam nonce copied from the recipient's address.
    pub nospam: [u8; 4],
    /// Free-form greeting (often JSON).
    pub message: String,
}

impl Payload for FriendRequestPayload {
    const PACKET_TYPE: PacketType = PacketType::FriendRequest;
}

/// FRIEND_ACCEPT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendAcceptPayload {
    /// Accepting side's online presence at the time of acceptance.
    pub is_online: bool,
}

impl Payload for FriendAcceptPayload {
    const PACKET_TYPE: PacketType = PacketType::FriendAccept;
}

/// MESSAGE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Sender-assigned id, echoed back in the receipt.
    pub message_id: i32,
    /// Normal or action message.
    pub kind: MessageKind,
    /// Message text.
    pub text: String,
}

impl Payload for MessagePayload {
    const PACKET_TYPE: PacketType = PacketType::Message;
}

/// RECEIPT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// Id of the message being acknowledged.
    pub message_id: i32,
}

impl Payload for ReceiptPayload {
    const PACKET_TYPE: PacketType = PacketType::Receipt;
}

/// TYPING payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    /// Whether the sender is typing.
    pub is_typing: bool,
}

impl Payload for TypingPayload {
    const PACKET_TYPE: PacketType = PacketType::Typing;
}

/// STATUS payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Whether the sender considers itself online.
    pub is_online: bool,
}

impl Payload for StatusPayload {
    const PACKET_TYPE: PacketType = PacketType::Status;
}

/// FILE_OFFER payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOfferPayload {
    /// Transfer id.
    pub transfer_id: [u8; 16],
    /// Sender-side message id for progress correlation.
    pub message_id: i32,
    /// Bundle file name.
    pub file_name: String,
    /// Bundle size in bytes.
    pub size: u64,
    /// SHA-256 of the whole bundle.
    pub sha256: [u8; 32],
    /// Chunk size the sender will serve.
    pub chunk_size: u32,
}

impl FileOfferPayload {
    /// Number of chunks needed to cover `size`; `None` for a zero chunk
    /// size or a count that does not fit in a `u32`.
    pub fn total_chunks(&self) -> Option<u32> {
        if self.chunk_size == 0 {
            return None;
        }
        u32::try_from(self.size.div_ceil(u64::from(self.chunk_size))).ok()
    }
}

impl Payload for FileOfferPayload {
    const PACKET_TYPE: PacketType = PacketType::FileOffer;
}

/// File transfer control signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileControl {
    /// Receiver accepted the offer.
    Accept,
    /// Either side aborts.
    Cancel {
        /// Human-readable reason.
        reason: String,
    },
    /// Receiver verified the bundle.
    Complete,
}

/// FILE_CONTROL payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileControlPayload {
    /// Transfer id.
    pub transfer_id: [u8; 16],
    /// Control signal.
    pub control: FileControl,
}

impl Payload for FileControlPayload {
    const PACKET_TYPE: PacketType = PacketType::FileControl;
}

/// FILE_CHUNK_REQUEST payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkRequestPayload {
    /// Transfer id.
    pub transfer_id: [u8; 16],
    /// Chunk index (0-based).
    pub chunk_index: u32,
}

impl Payload for FileChunkRequestPayload {
    const PACKET_TYPE: PacketType = PacketType::FileChunkRequest;
}

/// FILE_CHUNK payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    /// Transfer id.
    pub transfer_id: [u8; 16],
    /// Chunk index (0-based).
    pub chunk_index: u32,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

impl Payload for FileChunkPayload {
    const PACKET_TYPE: PacketType = PacketType::FileChunk;
}

/// Any decoded peer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPacket {
    /// Handshake opener.
    Hello(HelloPayload),
    /// Handshake reply.
    HelloAck(HelloAckPayload),
    /// Friend request.
    FriendRequest(FriendRequestPayload),
    /// Friend request accepted.
    FriendAccept(FriendAcceptPayload),
    /// Chat message.
    Message(MessagePayload),
    /// Read receipt.
    Receipt(ReceiptPayload),
    /// Typing indicator.
    Typing(TypingPayload),
    /// Presence.
    Status(StatusPayload),
    /// File offer.
    FileOffer(FileOfferPayload),
    /// File control.
    FileControl(FileControlPayload),
    /// Chunk request.
    FileChunkRequest(FileChunkRequestPayload),
    /// Chunk data.
    FileChunk(FileChunkPayload),
}

impl PeerPacket {
    /// Packet type of this variant.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Hello(_) => PacketType::Hello,
            Self::HelloAck(_) => PacketType::HelloAck,
            Self::FriendRequest(_) => PacketType::FriendRequest,
            Self::FriendAccept(_) => PacketType::FriendAccept,
            Self::Message(_) => PacketType::Message,
            Self::Receipt(_) => PacketType::Receipt,
            Self::Typing(_) => PacketType::Typing,
            Self::Status(_) => PacketType::Status,
            Self::FileOffer(_) => PacketType::FileOffer,
            Self::FileControl(_) => PacketType::FileControl,
            Self::FileChunkRequest(_) => PacketType::FileChunkRequest,
            Self::FileChunk(_) => PacketType::FileChunk,
        }
    }

    /// Frame as a packet.
    pub fn to_packet(&self) -> Result<Packet> {
        match self {
            Self::Hello(p) => p.to_packet(),
            Self::HelloAck(p) => p.to_packet(),
            Self::FriendRequest(p) => p.to_packet(),
            Self::FriendAccept(p) => p.to_packet(),
            Self::Message(p) => p.to_packet(),
            Self::Receipt(p) => p.to_packet(),
            Self::Typing(p) => p.to_packet(),
            Self::Status(p) => p.to_packet(),
            Self::FileOffer(p) => p.to_packet(),
            Self::FileControl(p) => p.to_packet(),
            Self::FileChunkRequest(p) => p.to_packet(),
            Self::FileChunk(p) => p.to_packet(),
        }
    }

    /// Decode a framed packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let bytes = &packet.payload;
        Ok(match packet.packet_type() {
            PacketType::Hello => Self::Hello(HelloPayload::from_bytes(bytes)?),
            PacketType::HelloAck => Self::HelloAck(HelloAckPayload::from_bytes(bytes)?),
            PacketType::FriendRequest => Self::FriendRequest(FriendRequestPayload::from_bytes(bytes)?),
            PacketType::FriendAccept => Self::FriendAccept(FriendAcceptPayload::from_bytes(bytes)?),
            PacketType::Message => Self::Message(MessagePayload::from_bytes(bytes)?),
            PacketType::Receipt => Self::Receipt(ReceiptPayload::from_bytes(bytes)?),
            PacketType::Typing => Self::Typing(TypingPayload::from_bytes(bytes)?),
            PacketType::Status => Self::Status(StatusPayload::from_bytes(bytes)?),
            PacketType::FileOffer => Self::FileOffer(FileOfferPayload::from_bytes(bytes)?),
            PacketType::FileControl => Self::FileControl(FileControlPayload::from_bytes(bytes)?),
            PacketType::FileChunkRequest => {
                Self::FileChunkRequest(FileChunkRequestPayload::from_bytes(bytes)?)
            }
            PacketType::FileChunk => Self::FileChunk(FileChunkPayload::from_bytes(bytes)?),
        })
    }

    /// Handshake packets never reach the engine.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Hello(_) | Self::HelloAck(_))
    }
}
