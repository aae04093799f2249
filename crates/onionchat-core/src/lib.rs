//! # onionchat core library
//!
//! Peer-to-peer messaging over Tor v3 onion services, without accounts or
//! servers. Peers are identified by an Ed25519 public key; the same key
//! names the hidden service the peer listens on.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Application (CLI, bridges)       │
//! ├─────────────────────────────────────────┤
//! │   messaging (ChatEngine)  │   events    │
//! ├─────────────────────────────────────────┤
//! │  transport (onion / in-memory loopback) │
//! ├─────────────────────────────────────────┤
//! │   tor (session, listener)  │  protocol  │
//! ├─────────────────────────────────────────┤
//! │                identity                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - No IP address exposure: all peer traffic goes through Tor
//! - Every stream opens with a signed handshake binding it to a key
//! - Friend requests must carry the nospam from the recipient's address
//! - Secret key material is zeroized and never logged

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod tor;
pub mod transport;

pub use error::{Error, Result};
pub use events::{ChatEvent, EventBus};
pub use messaging::{ChatEngine, EngineConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
