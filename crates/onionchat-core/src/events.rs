//! Event bus between the engine and its consumers.
//!
//! Events are published on a tokio broadcast channel. Every event has a
//! stable topic name so consumers that route by name (UI bridges, logs)
//! can subscribe selectively.

use crate::messaging::{MessageKind, MessageStatus};
use crate::tor::{ServerState, SessionState};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events published by the engine, the transport session and the listener.
///
/// Public keys are 64-character uppercase hex strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A friend sent a message.
    DidReceiveMessage {
        /// Sender.
        public_key: String,
        /// Sender-assigned message id.
        message_id: i32,
        /// Message text.
        text: String,
        /// Normal or action.
        kind: MessageKind,
    },
    /// A stranger sent a friend request.
    DidInitiateChat {
        /// Requester.
        public_key: String,
        /// Request message, often JSON.
        message: String,
    },
    /// Our own reachability changed.
    DidUpdateMyOnlineStatus {
        /// Whether the transport is up.
        is_online: bool,
    },
    /// Transport session state changed.
    SessionState(SessionState),
    /// A friend came online or went offline.
    DidUpdateFriendOnlineStatus {
        /// Friend.
        public_key: String,
        /// New status.
        is_online: bool,
    },
    /// A friend started or stopped typing.
    IsTyping {
        /// Friend.
        public_key: String,
        /// Typing flag.
        is_typing: bool,
    },
    /// A friend read one of our messages.
    DidUpdateFriendReadReceipt {
        /// Friend.
        public_key: String,
        /// Our message id.
        message_id: i32,
    },
    /// One of our messages changed delivery status.
    DidUpdateMessageStatus {
        /// Recipient.
        public_key: String,
        /// Our message id.
        message_id: i32,
        /// New status.
        status: MessageStatus,
    },
    /// Outgoing file transfer progress.
    DidUpdateFileSend {
        /// Recipient.
        public_key: String,
        /// 0..=100.
        progress: u8,
        /// Message id returned by `send_file`.
        message_id: i32,
    },
    /// Outgoing file transfer failed.
    DidUpdateFileErrorSend {
        /// Recipient.
        public_key: String,
        /// Message id returned by `send_file`.
        message_id: i32,
        /// Failure description.
        error: String,
    },
    /// Incoming file transfer progress; `file_path` is set on completion.
    DidUpdateFileReceive {
        /// Sender.
        public_key: String,
        /// 0..=100.
        progress: u8,
        /// Directory holding the unpacked bundle.
        file_path: Option<PathBuf>,
    },
    /// Hidden-service listener state.
    ServerState(ServerState),
}

impl ChatEvent {
    /// Stable topic name for routing.
    pub fn topic(&self) -> &'static str {
        match self {
            ChatEvent::DidReceiveMessage { .. } => "didReceiveMessage",
            ChatEvent::DidInitiateChat { .. } => "didInitiateChat",
            ChatEvent::DidUpdateMyOnlineStatus { .. } => "didUpdateMyOnlineStatus",
            ChatEvent::SessionState(_) => "sessionState",
            ChatEvent::DidUpdateFriendOnlineStatus { .. } => "didUpdateFriendOnlineStatus",
            ChatEvent::IsTyping { .. } => "isTyping",
            ChatEvent::DidUpdateFriendReadReceipt { .. } => "didUpdateFriendReadReceipt",
            ChatEvent::DidUpdateMessageStatus { .. } => "didUpdateMessageStatus",
            ChatEvent::DidUpdateFileSend { .. } => "didUpdateFileSend",
            ChatEvent::DidUpdateFileErrorSend { .. } => "didUpdateFileErrorSend",
            ChatEvent::DidUpdateFileReceive { .. } => "didUpdateFileReceive",
            ChatEvent::ServerState(_) => "serverState",
        }
    }
}

/// Broadcast bus for [`ChatEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, event: ChatEvent) -> usize {
        trace!(topic = event.topic(), "Publishing event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
