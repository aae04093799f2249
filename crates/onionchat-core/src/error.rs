//! Error types for OnionChat.
//!
//! Two families exist. [`TorServiceError`] covers the onion transport
//! session: these are fatal to a single start attempt and are never retried
//! internally. [`Error`] covers per-call protocol operations, which callers
//! may retry.
//!
//! Display strings are intentionally generic; details live in the payload.

use thiserror::Error;

/// Errors raised by the onion transport session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TorServiceError {
    /// The hidden-service hostname file is missing or unreadable.
    #[error("onion address for hidden service could not be loaded")]
    OnionAddressCouldNotBeLoaded,

    /// The hidden-service private key is missing or unreadable.
    #[error("error loading private key")]
    ErrorLoadingPrivateKey,

    /// Generating or persisting new key material failed.
    #[error("error generating key material")]
    KeyGeneration(String),

    /// Setting 0700 permissions on the hidden-service directory failed.
    #[error("failed to set permissions")]
    FailedToSetPermissions,

    /// Writing the torrc configuration failed.
    #[error("failed to write torrc")]
    FailedToWriteTorrc(String),

    /// The torrc file exists but is empty or unparsable.
    #[error("torrc is empty or corrupt")]
    CorruptTorrc(String),

    /// Creating the working directory failed.
    #[error("failed to create directory")]
    FailedToCreateDirectory(String),

    /// The base directory for Tor state is inaccessible.
    #[error("unable to access the caches directory")]
    UnableToAccessCachesDirectory,

    /// Creating the client onion-auth directory failed.
    #[error("auth directory could not be created")]
    AuthDirectory(String),

    /// Removing client onion-auth keys failed.
    #[error("error when deleting keys")]
    ErrorWhenDeletingKeys(String),

    /// Control-port communication or bootstrap failed.
    #[error("something went wrong")]
    SomethingWentWrong(String),
}

/// Core error type for engine and transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport session failure.
    #[error("transport error: {0}")]
    Transport(#[from] TorServiceError),

    /// Tor connection or circuit error.
    #[error("tor error")]
    Tor(String),

    /// Peer address failed length, hex or checksum validation.
    #[error("invalid peer address")]
    InvalidAddress(String),

    /// Key validation failed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Attempted to befriend our own address.
    #[error("cannot add own address as friend")]
    OwnKey,

    /// No friend with this public key.
    #[error("friend not found")]
    FriendNotFound,

    /// No pending inbound request from this public key.
    #[error("friend request not found")]
    RequestNotFound,

    /// Message was empty or exceeded the maximum length.
    #[error("invalid message")]
    InvalidMessage(String),

    /// Wire protocol error. Malformed packets are dropped.
    #[error("protocol error")]
    Protocol(String),

    /// Persisted engine state could not be decoded.
    #[error("invalid saved state")]
    InvalidState(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// File access error.
    #[error("storage error")]
    Storage(String),

    /// File transfer error.
    #[error("file transfer error")]
    Transfer(String),

    /// Transport is not connected.
    #[error("transport not ready")]
    NotReady,

    /// Operation was cancelled because the transport stopped.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine task has shut down.
    #[error("engine stopped")]
    EngineStopped,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using OnionChat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Protocol errors on malformed input are dropped without a reply.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Encoding(_))
    }

    /// Whether this error is a cancellation caused by transport shutdown.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::EngineStopped)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_error_wraps() {
        let err: Error = TorServiceError::FailedToSetPermissions.into();
        assert!(matches!(err, Error::Transport(TorServiceError::FailedToSetPermissions)));
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::Protocol("x".into()).should_silent_drop());
        assert!(!Error::FriendNotFound.should_silent_drop());
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::NotReady.is_cancellation());
    }
}
