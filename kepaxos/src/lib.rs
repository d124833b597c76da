//! `kepaxos` implements the Key-Based Egalitarian Paxos (k-ePaxos)
//! replication engine: a per-key agreement protocol that keeps a fixed set
//! of peer replicas in sync on the sequence of mutations applied to each
//! opaque byte-string key, tolerating up to `floor(N/2)` simultaneous
//! replica failures.
//!
//! The crate is organized the way the protocol decomposes:
//!
//! - [`ballot`] — the monotonic ballot/sequence numbering scheme.
//! - [`codec`] — the wire format for protocol messages.
//! - [`command`] — the in-memory per-key command table and its sweeper.
//! - [`storage`] — the `Log` trait for the persistent per-key commit log.
//! - `engine` (private) — the fast-path/slow-path protocol state machine.
//! - [`replica`] — the replica context and client API ([`replica::Replica`]).
//! - [`config`] — construction inputs for a replica.
//! - [`error`] — typed errors for the externally observable failure modes.

pub mod ballot;
pub mod codec;
pub mod command;
pub mod config;
mod engine;
pub mod error;
pub mod logging;
pub mod replica;
pub mod storage;

pub use ballot::Ballot;
pub use codec::{Message, MessageType};
pub use config::ReplicaConfig;
pub use error::{CodecError, ConfigError, SubmitError};
pub use replica::{Callbacks, Replica};
pub use storage::{Log, LogRecord, MemoryLog};
