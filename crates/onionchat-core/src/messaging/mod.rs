//! Friend-based messaging.
//!
//! [`ChatEngine`] runs the friend protocol: friend requests gated by the
//! address nospam, text messages with receipts, typing and presence, and
//! chunked file bundles. It knows nothing about Tor; it drives whatever
//! transport it is given.

mod engine;
mod file_transfer;
mod friend;
mod message;
mod state;

pub use engine::{ChatEngine, EngineConfig, StatusCallback};
pub use file_transfer::{
    build_bundle, sanitize_file_name, sha256_file, unpack_bundle, BuiltBundle, BundleEntry,
    BundleManifest, IncomingTransfer, OutgoingTransfer, TransferState, DEFAULT_CHUNK_SIZE,
    DEFAULT_CHUNK_WINDOW, DEFAULT_MAX_FILE_SIZE, MAX_CHUNK_SIZE, MAX_TRANSFER_CHUNKS,
    MODEL_FILE_NAME, RECORD_MODEL_FILE_NAME,
};
pub use friend::{ConnectionStatus, Friend, FriendState, FriendTable, OutboundRequest};
pub use message::{
    validate_text, Direction, Message, MessageBody, MessageIdAllocator, MessageKind, MessageStatus,
    MAX_MESSAGE_LENGTH,
};
pub use state::{SavedFriend, SavedRequest, SavedState, STATE_VERSION};
