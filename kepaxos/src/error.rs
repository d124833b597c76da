//! Typed errors for the parts of the engine that are externally observable.
//!
//! Internal protocol drops (stale ballot, already-committed, quorum not yet
//! reached) are not errors — per the spec's error-handling policy they are
//! silent no-ops logged at `debug`/`warn` and never surface here.

use thiserror::Error;

/// Failure returned by [`crate::replica::Replica::submit`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The command did not commit within its deadline and was swept away.
    #[error("submit timed out waiting for a quorum")]
    Timeout,
    /// A newer command for the same key replaced ours before we committed.
    #[error("command was superseded by a newer submission for the same key")]
    Superseded,
    /// The replica is shutting down; the sweeper is no longer running.
    #[error("replica is shutting down")]
    ShuttingDown,
    /// The embedder's commit handler rejected the mutation at the leader.
    #[error("commit handler rejected the mutation")]
    CommitFailed,
}

/// A malformed wire frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: got {got} bytes, need at least {min}")]
    Truncated { got: usize, min: usize },
    #[error("unknown message type byte {0}")]
    UnknownMessageType(u8),
    #[error("declared field length {field} exceeds remaining frame bytes")]
    FieldOverrun { field: &'static str },
    #[error("sender string is not NUL-terminated")]
    SenderNotTerminated,
}

/// Configuration construction failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("peer list has {0} entries, which exceeds the 256-replica cap")]
    TooManyPeers(usize),
    #[error("my_index {index} is out of range for {peer_count} peers")]
    IndexOutOfRange { index: usize, peer_count: usize },
    #[cfg(feature = "toml_config")]
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}
