//! Message types and handling.

use crate::error::{Error, Result};
use crate::identity::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Maximum text length in bytes for messages and friend requests.
pub const MAX_MESSAGE_LENGTH: usize = 32 * 1024;

/// Message kind, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Regular chat message.
    Normal,
    /// Action ("/me waves").
    Action,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Normal
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Written locally.
    Own,
    /// Received from a friend.
    Received,
}

/// Message delivery/read status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Queued locally.
    Sending,
    /// Handed to the transport.
    Sent,
    /// Receipt came back.
    Read,
    /// Delivery failed or was cancelled.
    Error,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Read => "read",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// What a message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Text.
    Text(String),
    /// A file bundle, referenced by path.
    File(PathBuf),
}

/// A message with metadata.
#[derive(Debug, Clone)]
pub struct Message {
    /// Engine-assigned id for own messages, sender id for received ones.
    pub id: i32,
    /// The friend on the other end.
    pub peer: PublicKey,
    /// Own or received.
    pub direction: Direction,
    /// Delivery status.
    pub status: MessageStatus,
    /// Normal or action.
    pub kind: MessageKind,
    /// Payload.
    pub body: MessageBody,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
}

impl Message {
    /// Create a new outgoing text message.
    pub fn outgoing(id: i32, peer: PublicKey, kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            id,
            peer,
            direction: Direction::Own,
            status: MessageStatus::Sending,
            kind,
            body: MessageBody::Text(text.into()),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Text content if this is a text message.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(s) => Some(s),
            MessageBody::File(_) => None,
        }
    }

    /// Mark message as sent.
    pub fn mark_sent(&mut self) -> bool {
        self.transition(&[MessageStatus::Sending], MessageStatus::Sent)
    }

    /// Mark message as read.
    pub fn mark_read(&mut self) -> bool {
        self.transition(&[MessageStatus::Sending, MessageStatus::Sent], MessageStatus::Read)
    }

    /// Mark message as failed.
    pub fn mark_failed(&mut self) -> bool {
        self.transition(&[MessageStatus::Sending, MessageStatus::Sent], MessageStatus::Error)
    }

    fn transition(&mut self, from: &[MessageStatus], to: MessageStatus) -> bool {
        if from.contains(&self.status) {
            self.status = to;
            true
        } else {
            false
        }
    }
}

/// Validate a message or friend-request text.
pub fn validate_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(Error::InvalidMessage("message is empty".into()));
    }
    if text.len() > MAX_MESSAGE_LENGTH {
        return Err(Error::InvalidMessage(format!(
            "message is {} bytes, limit is {}",
            text.len(),
            MAX_MESSAGE_LENGTH
        )));
    }
    Ok(())
}

/// Per-session message id allocator: 1, 2, 3, ...
#[derive(Debug)]
pub struct MessageIdAllocator {
    next: i32,
}

impl MessageIdAllocator {
    /// Start at 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next id.
    pub fn allocate(&mut self) -> Result<i32> {
        let id = self.next;
        self.next = self
            .next
            .checked_add(1)
            .ok_or_else(|| Error::InvalidState("message id space exhausted".into()))?;
        Ok(id)
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_status_transitions() {
        let mut msg = Message::outgoing(1, PublicKey::from_bytes([1; 32]), MessageKind::Normal, "hi");
        assert_eq!(msg.status, MessageStatus::Sending);
        assert_eq!(msg.text(), Some("hi"));

        assert!(msg.mark_sent());
        assert!(!msg.mark_sent());
        assert!(msg.mark_read());
        assert_eq!(msg.status, MessageStatus::Read);
        assert!(!msg.mark_failed());
    }

    #[test]
    fn test_validate_text() {
        assert!(validate_text("hello").is_ok());
        assert!(matches!(validate_text(""), Err(Error::InvalidMessage(_))));
        assert!(validate_text(&"x".repeat(MAX_MESSAGE_LENGTH)).is_ok());
        assert!(validate_text(&"x".repeat(MAX_MESSAGE_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_ids_strictly_increase_from_one() {
        let mut ids = MessageIdAllocator::new();
        let allocated: Vec<i32> = (0..5).map(|_| ids.allocate().expect("id")).collect();
        assert_eq!(allocated, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_id_exhaustion() {
        let mut ids = MessageIdAllocator { next: i32::MAX };
        assert!(ids.allocate().is_err());
    }
}
