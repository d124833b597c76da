//! The persistent per-key log (§4.1): the `Log` trait embedders implement,
//! plus a `MemoryLog` reference implementation used by tests and by
//! embedders that accept no durability at all.

use crate::ballot::Ballot;
use dashmap::DashMap;

/// A single committed `(ballot, seq)` pair for one key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde_types", derive(serde::Serialize, serde::Deserialize))]
pub struct LogRecord {
    pub ballot: Ballot,
    pub seq: u64,
}

/// The durable per-key commit log (§4.1).
///
/// Atomicity per key is required; atomicity across keys is not. Concurrent
/// readers and a single writer (per `kepaxos`'s lock discipline, guarded by
/// the replica lock) must be safe, so implementations only need interior
/// mutability, not their own external synchronization for correctness
/// against `kepaxos` itself — but must still be `Send + Sync` since the
/// sweeper and protocol threads all hold a shared reference.
pub trait Log: Send + Sync {
    /// `(seq, ballot)` for a key, or `(0, Ballot::zero())` if never committed.
    fn last_seq_for_key(&self, key: &[u8]) -> (u64, Ballot);

    /// Record a commit. Caller guarantees `seq` is at least the existing seq.
    fn set_last_seq_for_key(&self, key: &[u8], ballot: Ballot, seq: u64);

    /// The maximum ballot observed across all keys, or `Ballot::zero()` if empty.
    fn max_ballot(&self) -> Ballot;

    /// All `(key, ballot, seq)` entries whose ballot counter exceeds `since.counter()`.
    fn diff_from_ballot(&self, since: Ballot) -> Vec<(Vec<u8>, Ballot, u64)>;
}

/// In-memory `Log`, backed by a sharded concurrent map.
#[derive(Default)]
pub struct MemoryLog {
    entries: DashMap<Vec<u8>, LogRecord>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog {
            entries: DashMap::new(),
        }
    }
}

impl Log for MemoryLog {
    fn last_seq_for_key(&self, key: &[u8]) -> (u64, Ballot) {
        match self.entries.get(key) {
            Some(record) => (record.seq, record.ballot),
            None => (0, Ballot::zero()),
        }
    }

    fn set_last_seq_for_key(&self, key: &[u8], ballot: Ballot, seq: u64) {
        self.entries.insert(key.to_vec(), LogRecord { ballot, seq });
    }

    fn max_ballot(&self) -> Ballot {
        self.entries
            .iter()
            .map(|e| e.value().ballot)
            .max()
            .unwrap_or_else(Ballot::zero)
    }

    fn diff_from_ballot(&self, since: Ballot) -> Vec<(Vec<u8>, Ballot, u64)> {
        self.entries
            .iter()
            .filter(|e| e.value().ballot.counter() > since.counter())
            .map(|e| (e.key().clone(), e.value().ballot, e.value().seq))
            .collect()
    }
}
