//! The in-memory command table (§4.3): at most one active command per key,
//! with a background sweeper that expires stalled commands and asks the
//! engine to trigger recovery for them.

use crate::ballot::Ballot;
use crate::error::SubmitError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    PreAccepted,
    Accepted,
    Committed,
}

/// A single collected response record (§3, `votes[]`).
#[derive(Clone, Debug)]
pub struct Vote {
    pub peer: String,
    pub seq: u64,
    pub ballot: Ballot,
}

/// Mutable fields guarded by the command's own lock; see §3 invariants.
pub(crate) struct Inner {
    pub status: Status,
    pub seq: u64,
    pub ballot: Ballot,
    pub votes: Vec<Vote>,
    pub max_seq: u64,
    pub max_voter: Option<String>,
    pub max_seq_committed: bool,
    pub timestamp: Instant,
}

/// Outcome delivered to a blocked `submit` call.
pub type SubmitOutcome = Result<(), SubmitError>;

/// The in-flight command state for one key.
pub struct Command {
    pub ctype: u8,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub timeout: Duration,
    /// Whether the originating `submit` call is blocked on this command.
    pub waiting: AtomicBool,
    pub(crate) inner: Mutex<Inner>,
    completion: Mutex<Option<SyncSender<SubmitOutcome>>>,
}

impl Command {
    pub fn new(
        ctype: u8,
        key: Vec<u8>,
        data: Vec<u8>,
        seq: u64,
        ballot: Ballot,
        status: Status,
        timeout: Duration,
    ) -> Self {
        Command {
            ctype,
            key,
            data,
            timeout,
            waiting: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                status,
                seq,
                ballot,
                votes: Vec::new(),
                max_seq: 0,
                max_voter: None,
                max_seq_committed: false,
                timestamp: Instant::now(),
            }),
            completion: Mutex::new(None),
        }
    }

    /// Attach a single-producer/single-consumer completion channel and mark
    /// this command as having a blocked waiter, returning the receiver end.
    pub fn register_waiter(&self) -> Receiver<SubmitOutcome> {
        let (tx, rx) = sync_channel(1);
        *self.completion.lock() = Some(tx);
        self.waiting.store(true, Ordering::SeqCst);
        rx
    }

    /// Wake a blocked waiter, if any, with the given outcome. Idempotent.
    pub fn complete(&self, outcome: SubmitOutcome) {
        if let Some(tx) = self.completion.lock().take() {
            // The receiver may already be gone (timed out and dropped); a
            // failed send just means nobody was listening anymore.
            let _ = tx.send(outcome);
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    pub fn refresh_timestamp(&self) {
        self.inner.lock().timestamp = Instant::now();
    }

    fn is_expired(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        now.duration_since(inner.timestamp) >= self.timeout
    }
}

/// Information the sweeper hands back when it expires a command that was
/// under another replica's ballot, so the caller can trigger recovery.
pub struct ExpiredForRecovery {
    pub key: Vec<u8>,
    pub ballot: Ballot,
    pub seq: u64,
}

/// The per-replica command table: one active `Command` per key, plus a
/// background sweeper thread running at roughly 20 Hz.
pub struct CommandTable {
    map: Arc<DashMap<Vec<u8>, Arc<Command>>>,
    quit: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CommandTable {
    /// `my_index` identifies which ballots are "ours"; entries whose ballot
    /// names another replica are eligible for the recovery callback.
    pub fn new<F>(my_index: u8, on_recoverable_expiry: F) -> Self
    where
        F: Fn(ExpiredForRecovery) + Send + Sync + 'static,
    {
        let map: Arc<DashMap<Vec<u8>, Arc<Command>>> = Arc::new(DashMap::new());
        let quit = Arc::new(AtomicBool::new(false));

        let sweeper = {
            let map = Arc::clone(&map);
            let quit = Arc::clone(&quit);
            std::thread::Builder::new()
                .name("kepaxos-sweeper".into())
                .spawn(move || {
                    // ~20 Hz, i.e. a 50ms period between passes.
                    while !quit.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(50));
                        let now = Instant::now();
                        let expired: Vec<(Vec<u8>, Arc<Command>)> = map
                            .iter()
                            .filter(|e| e.value().is_expired(now))
                            .map(|e| (e.key().clone(), Arc::clone(e.value())))
                            .collect();

                        for (key, cmd) in expired {
                            // Only remove if it's still the same command instance;
                            // it may have been replaced or completed concurrently.
                            let removed = map
                                .remove_if(&key, |_, v| Arc::ptr_eq(v, &cmd))
                                .is_some();
                            if !removed {
                                continue;
                            }

                            cmd.complete(Err(SubmitError::Timeout));

                            let (status, ballot, seq) = {
                                let inner = cmd.inner.lock();
                                (inner.status, inner.ballot, inner.seq)
                            };
                            let names_other_replica = ballot.replica() != my_index;
                            if matches!(status, Status::PreAccepted | Status::Accepted)
                                && names_other_replica
                            {
                                on_recoverable_expiry(ExpiredForRecovery { key, ballot, seq });
                            }
                        }
                    }
                })
                .expect("failed to spawn sweeper thread")
        };

        CommandTable {
            map,
            quit,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Atomically install `new_cmd` for `key`, evicting and waking any prior
    /// command for the same key (it fails silently per §3 invariants).
    pub fn insert_evicting(&self, key: Vec<u8>, new_cmd: Arc<Command>) -> Option<Arc<Command>> {
        let old = self.map.insert(key, new_cmd);
        if let Some(ref old) = old {
            old.complete(Err(SubmitError::Superseded));
        }
        old
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<Command>> {
        self.map.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Remove `key`'s command iff it is still `expected` (identity check),
    /// returning whether the removal happened.
    pub fn remove_if_same(&self, key: &[u8], expected: &Arc<Command>) -> bool {
        self.map
            .remove_if(key, |_, v| Arc::ptr_eq(v, expected))
            .is_some()
    }

    pub fn remove(&self, key: &[u8]) -> Option<Arc<Command>> {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CommandTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_timeout_cmd() -> Arc<Command> {
        Arc::new(Command::new(
            0,
            b"k".to_vec(),
            Vec::new(),
            1,
            Ballot::new(1, 1),
            Status::PreAccepted,
            Duration::from_millis(20),
        ))
    }

    #[test]
    fn insert_evicts_and_wakes_prior_command() {
        let table = CommandTable::new(0, |_| {});
        let first = short_timeout_cmd();
        table.insert_evicting(b"k".to_vec(), Arc::clone(&first));
        let rx = first.register_waiter();

        let second = short_timeout_cmd();
        table.insert_evicting(b"k".to_vec(), second);

        assert_eq!(rx.recv().unwrap(), Err(SubmitError::Superseded));
        table.shutdown();
    }

    #[test]
    fn sweeper_expires_and_triggers_recovery_for_foreign_ballot() {
        use std::sync::mpsc::channel;
        let (tx, rx) = channel();
        let table = CommandTable::new(0, move |expired| {
            tx.send(expired.key).unwrap();
        });

        let cmd = Arc::new(Command::new(
            0,
            b"expiring".to_vec(),
            Vec::new(),
            1,
            Ballot::new(1, 7), // names replica 7, not us (my_index = 0)
            Status::PreAccepted,
            Duration::from_millis(10),
        ));
        table.insert_evicting(b"expiring".to_vec(), Arc::clone(&cmd));
        let waiter = cmd.register_waiter();

        let recovered_key = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(recovered_key, b"expiring".to_vec());
        assert_eq!(waiter.recv().unwrap(), Err(SubmitError::Timeout));
        assert!(table.get(b"expiring").is_none());
        table.shutdown();
    }

    #[test]
    fn sweeper_does_not_recover_our_own_ballot() {
        use std::sync::mpsc::channel;
        let (tx, rx) = channel::<Vec<u8>>();
        let table = CommandTable::new(3, move |expired| {
            tx.send(expired.key).unwrap();
        });

        let cmd = Arc::new(Command::new(
            0,
            b"mine".to_vec(),
            Vec::new(),
            1,
            Ballot::new(1, 3), // our own index
            Status::Accepted,
            Duration::from_millis(10),
        ));
        table.insert_evicting(b"mine".to_vec(), cmd);

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        table.shutdown();
    }
}
