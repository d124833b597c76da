//! `rocksdb`-backed [`kepaxos::storage::Log`] (§4.1, feature `persistent_storage`).
//!
//! One column family keyed directly by the opaque key bytes. Single-record
//! reads and writes go through `bincode`+`serde` for convenience; the full
//! scan driving `diff_from_ballot`/`max_ballot` reinterprets the stored bytes
//! in place via `zerocopy` instead of deserializing each record, since that
//! path walks the whole column family.

use kepaxos::{Ballot, Log};
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

#[derive(Clone, Copy, AsBytes, FromBytes, Serialize, Deserialize)]
#[repr(C)]
struct RawRecord {
    ballot: u64,
    seq: u64,
}

fn encode(record: RawRecord) -> Vec<u8> {
    bincode::serialize(&record).expect("RawRecord is a fixed-size 16-byte struct")
}

fn decode_written(bytes: &[u8]) -> RawRecord {
    bincode::deserialize(bytes).expect("log record corrupt or from an incompatible version")
}

fn decode_scan(bytes: &[u8]) -> Option<RawRecord> {
    LayoutVerified::<_, RawRecord>::new(bytes).map(|lv| *lv)
}

/// Durable per-key commit log backed by a single RocksDB instance.
pub struct RocksLog {
    db: DB,
}

impl RocksLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rocksdb::Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(RocksLog { db })
    }
}

impl Log for RocksLog {
    fn last_seq_for_key(&self, key: &[u8]) -> (u64, Ballot) {
        match self.db.get(key).expect("rocksdb get failed") {
            Some(bytes) => {
                let record = decode_written(&bytes);
                (record.seq, Ballot::from_raw(record.ballot))
            }
            None => (0, Ballot::zero()),
        }
    }

    fn set_last_seq_for_key(&self, key: &[u8], ballot: Ballot, seq: u64) {
        let record = RawRecord {
            ballot: ballot.raw(),
            seq,
        };
        self.db
            .put(key, encode(record))
            .expect("rocksdb put failed");
    }

    fn max_ballot(&self) -> Ballot {
        self.db
            .iterator(IteratorMode::Start)
            .filter_map(|item| item.ok())
            .filter_map(|(_, v)| decode_scan(&v))
            .map(|r| Ballot::from_raw(r.ballot))
            .max()
            .unwrap_or_else(Ballot::zero)
    }

    fn diff_from_ballot(&self, since: Ballot) -> Vec<(Vec<u8>, Ballot, u64)> {
        self.db
            .iterator(IteratorMode::Start)
            .filter_map(|item| item.ok())
            .filter_map(|(k, v)| decode_scan(&v).map(|r| (k, r)))
            .filter(|(_, r)| Ballot::from_raw(r.ballot).counter() > since.counter())
            .map(|(k, r)| (k.to_vec(), Ballot::from_raw(r.ballot), r.seq))
            .collect()
    }
}
