//! Storage backends for [`kepaxos::storage::Log`].
//!
//! [`kepaxos::storage::MemoryLog`] is re-exported here for convenience;
//! [`RocksLog`] is the durable, `rocksdb`-backed implementation gated behind
//! the `persistent_storage` feature.

pub use kepaxos::storage::MemoryLog;

#[cfg(feature = "persistent_storage")]
mod rocks;
#[cfg(feature = "persistent_storage")]
pub use rocks::RocksLog;
