//! Replica context (§3 "Replica context", §6 external interfaces) and the
//! client-facing API (§4.6, C6).

use crate::ballot::{Ballot, BallotAllocator};
use crate::codec::{Message, MessageType};
use crate::command::{Command, CommandTable, Status};
use crate::config::ReplicaConfig;
use crate::engine;
use crate::error::{CodecError, ConfigError, SubmitError};
use crate::storage::Log;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type SendFn = dyn Fn(&[String], &[u8]) -> i32 + Send + Sync;
type CommitFn = dyn Fn(u8, &[u8], &[u8], bool) -> i32 + Send + Sync;
type RecoverFn = dyn Fn(&str, &[u8], u64, Ballot) -> i32 + Send + Sync;

/// Embedder-supplied collaborators (§6): transport, the application commit
/// handler, and the out-of-band recovery helper.
#[derive(Clone)]
pub struct Callbacks {
    /// `send(recipients, payload) -> i32`; best-effort unicast/broadcast.
    pub send: Arc<SendFn>,
    /// `commit(ctype, key, data, leader_flag) -> i32`; 0 on success.
    pub commit: Arc<CommitFn>,
    /// `recover(peer, key, seq, ballot) -> i32`; asynchronous catch-up request.
    pub recover: Arc<RecoverFn>,
}

/// A k-ePaxos replica: owns the ballot allocator, command table, and a
/// handle to the persistent log; drives the protocol engine in `engine`.
pub struct Replica {
    pub(crate) my_index: u8,
    pub(crate) peers: Arc<Vec<String>>,
    pub(crate) ballot: BallotAllocator,
    pub(crate) log: Arc<dyn Log>,
    pub(crate) commands: CommandTable,
    pub(crate) timeout: Duration,
    pub(crate) callbacks: Callbacks,
    /// Replica-wide lock; acquired before any per-command lock and released
    /// before invoking `send`/`commit`/`recover` (§5 lock discipline).
    pub(crate) state_lock: Mutex<()>,
    pub(crate) logger: slog::Logger,
}

impl Replica {
    pub fn new(
        config: ReplicaConfig,
        log: Arc<dyn Log>,
        callbacks: Callbacks,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let peers = Arc::new(config.peers.clone());
        let my_index = config.my_index;
        let logger = crate::logging::default_logger(my_index);

        let sweeper_peers = Arc::clone(&peers);
        let sweeper_callbacks = callbacks.clone();
        let sweeper_logger = logger.clone();
        let commands = CommandTable::new(my_index, move |expired| {
            if let Some(peer) = sweeper_peers.get(expired.ballot.replica() as usize) {
                let rc = (sweeper_callbacks.recover)(peer, &expired.key, expired.seq, expired.ballot);
                if rc < 0 {
                    slog::warn!(sweeper_logger, "recover callback failed on sweep"; "peer" => peer, "rc" => rc);
                } else {
                    slog::info!(sweeper_logger, "triggered recovery for expired command"; "peer" => peer, "key_len" => expired.key.len());
                }
            }
        });

        Ok(Arc::new(Replica {
            my_index,
            peers,
            ballot: BallotAllocator::new(my_index),
            log,
            commands,
            timeout: config.timeout,
            callbacks,
            state_lock: Mutex::new(()),
            logger,
        }))
    }

    /// §4.6: `submit(type, key, data) -> ok | failed`.
    ///
    /// Blocks the caller until the command commits, is superseded, or times
    /// out; success is decided solely by re-reading the log afterward, per
    /// the original design (a later wake for an unrelated reason does not
    /// by itself mean failure if the log already caught up).
    pub fn submit(&self, ctype: u8, key: Vec<u8>, data: Vec<u8>) -> Result<(), SubmitError> {
        let seq = {
            let _guard = self.state_lock.lock();
            let (prev_seq, _) = self.log.last_seq_for_key(&key);
            let mut seq = prev_seq + 1;
            if let Some(prior) = self.commands.get(&key) {
                let prior_seq = prior.lock().seq;
                seq = seq.max(prior_seq + 1);
            }
            seq
        };

        let ballot = self.ballot.current();
        let cmd = Arc::new(Command::new(
            ctype,
            key.clone(),
            data,
            seq,
            ballot,
            Status::PreAccepted,
            self.timeout,
        ));
        let rx = cmd.register_waiter();

        {
            let _guard = self.state_lock.lock();
            self.commands.insert_evicting(key.clone(), Arc::clone(&cmd));
        }

        let msg = Message::control(MessageType::PreAccept, self.my_name(), ballot, key.clone(), seq);
        self.broadcast(&msg);

        let outcome = rx.recv_timeout(self.timeout);
        let (committed_seq, _) = self.log.last_seq_for_key(&key);
        if committed_seq >= seq {
            Ok(())
        } else {
            match outcome {
                Ok(Err(e)) => Err(e),
                _ => Err(SubmitError::Timeout),
            }
        }
    }

    /// §4.6: `ballot() -> u64`.
    pub fn ballot(&self) -> u64 {
        self.ballot.current().raw()
    }

    /// §4.6: `seq(key) -> u64`.
    pub fn seq(&self, key: &[u8]) -> u64 {
        self.log.last_seq_for_key(key).0
    }

    /// §4.6: `diff(since_ballot) -> list<(key, ballot, seq)>`.
    pub fn diff(&self, since_ballot: u64) -> Vec<(Vec<u8>, u64, u64)> {
        self.log
            .diff_from_ballot(Ballot::from_raw(since_ballot))
            .into_iter()
            .map(|(k, b, s)| (k, b.raw(), s))
            .collect()
    }

    /// §4.5.8: apply authoritative state pulled by the recovery helper.
    pub fn recovered(&self, key: &[u8], ballot_raw: u64, seq: u64) {
        let ballot = Ballot::from_raw(ballot_raw);
        let (local_seq, local_ballot) = self.log.last_seq_for_key(key);
        if seq >= local_seq && ballot >= local_ballot {
            self.log.set_last_seq_for_key(key, ballot, seq);
        }
    }

    /// Decode and dispatch one wire frame (§4.4, §4.5).
    pub fn handle_wire_message(&self, bytes: &[u8]) -> Result<(), CodecError> {
        let msg = Message::decode(bytes)?;
        self.dispatch(msg);
        Ok(())
    }

    /// Dispatch an already-decoded message; every inbound message passes
    /// through `observe` first so the local ballot tracks the network max.
    pub fn dispatch(&self, msg: Message) {
        self.ballot.observe(msg.ballot);
        slog::debug!(self.logger, "handling message"; "mtype" => ?msg.mtype, "from" => &msg.sender);
        match msg.mtype {
            MessageType::PreAccept => engine::handle_pre_accept(self, msg),
            MessageType::PreAcceptResponse => engine::handle_pre_accept_response(self, msg),
            MessageType::Accept => engine::handle_accept(self, msg),
            MessageType::AcceptResponse => engine::handle_accept_response(self, msg),
            MessageType::Commit => engine::handle_commit(self, msg),
        }
    }

    /// Stop the sweeper thread. Idempotent; also run on `Drop`.
    pub fn shutdown(&self) {
        self.commands.shutdown();
    }

    pub(crate) fn my_name(&self) -> String {
        self.peers[self.my_index as usize].clone()
    }

    pub(crate) fn broadcast(&self, msg: &Message) {
        let recipients: Vec<String> = self
            .peers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i as u8 != self.my_index)
            .map(|(_, p)| p.clone())
            .collect();
        if recipients.is_empty() {
            return;
        }
        let payload = msg.encode();
        let rc = (self.callbacks.send)(&recipients, &payload);
        if rc < 0 {
            slog::warn!(self.logger, "broadcast send failed"; "mtype" => ?msg.mtype, "rc" => rc);
        }
    }

    pub(crate) fn send_to(&self, recipient: &str, msg: &Message) {
        let payload = msg.encode();
        let rc = (self.callbacks.send)(&[recipient.to_string()], &payload);
        if rc < 0 {
            slog::warn!(self.logger, "unicast send failed"; "to" => recipient, "rc" => rc);
        }
    }

    pub(crate) fn trigger_recover(&self, replica_idx: u8, key: &[u8], seq: u64, ballot: Ballot) {
        if let Some(peer) = self.peers.get(replica_idx as usize) {
            let rc = (self.callbacks.recover)(peer, key, seq, ballot);
            if rc < 0 {
                slog::warn!(self.logger, "recover callback failed"; "peer" => peer, "rc" => rc);
            }
        }
    }

    /// §4.5.6 commit procedure, shared by the fast and slow paths.
    pub(crate) fn commit(&self, cmd: Arc<Command>, ballot: Ballot, seq: u64) {
        let rc = (self.callbacks.commit)(cmd.ctype, &cmd.key, &cmd.data, true);
        if rc == 0 {
            self.log.set_last_seq_for_key(&cmd.key, ballot, seq);
            let commit_msg = Message::commit(
                self.my_name(),
                ballot,
                cmd.ctype,
                cmd.key.clone(),
                cmd.data.clone(),
                seq,
            );
            self.broadcast(&commit_msg);
            slog::info!(self.logger, "committed"; "seq" => seq, "ballot" => ballot.raw());
            cmd.complete(Ok(()));
        } else {
            // §7: commit handler failure destroys the command; no log
            // update, no COMMIT broadcast. Recovery is left to the next
            // submit/retry, as called out as an open policy question.
            slog::warn!(self.logger, "commit handler rejected mutation"; "rc" => rc);
            cmd.complete(Err(SubmitError::CommitFailed));
        }
    }

}

impl Drop for Replica {
    fn drop(&mut self) {
        self.shutdown();
    }
}
