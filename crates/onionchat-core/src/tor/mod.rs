//! Tor integration.
//!
//! - [`TorService`]: the onion transport session (bootstrap, hidden
//!   service key, state machine)
//! - [`ProxySession`]: outbound connections through the SOCKS5 proxy
//! - [`HiddenServiceListener`]: the local port the hidden service forwards to
//! - [`TorController`]: the ControlPort client underneath
//!
//! All peer traffic goes through Tor; there is no clearnet fallback.

mod connection;
mod controller;
mod listener;
mod session;

pub use connection::{socks5_handshake, ProxySession};
pub use controller::{parse_bootstrap_progress, ControlEvent, ProtocolInfo, TorAuth, TorController};
pub use listener::{
    ConnectionReporter, HiddenServiceListener, IncomingConnection, ListenerConfig, ServerCallback,
    ServerState,
};
pub use session::{SessionResult, SessionState, StateAction, TorConfig, TorService};

/// Default SOCKS5 proxy port for Tor.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default control port for Tor.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Default virtual port exposed on onion services.
pub const DEFAULT_VIRTUAL_PORT: u16 = 80;

/// Connection timeout for Tor circuits (seconds).
pub const CIRCUIT_TIMEOUT_SECS: u64 = 120;
