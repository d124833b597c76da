//! The protocol state machine (§4.5): handlers for each inbound message
//! type. Every handler acquires the replica-wide lock first, mutates
//! command-table/log state, releases it, and only then invokes a callback
//! (`send`/`commit`/`recover`) — never the reverse (§5 lock discipline).

use crate::ballot::Ballot;
use crate::codec::{Message, MessageType};
use crate::command::{Command, Status, Vote};
use crate::replica::Replica;
use std::sync::Arc;
use std::time::Instant;

/// Quorum size: `floor(N/2)` *responses*, i.e. a majority of `N` including
/// the proposer itself. This preserves the source's "responses excluding
/// self" interpretation flagged as an open question in the design notes —
/// verified against the spec's minority-failure seed scenario (N=5, two
/// replicas down ⇒ 2 responses arrive, `floor(5/2) = 2`, round commits).
pub(crate) fn required_votes(n_peers: usize) -> usize {
    n_peers / 2
}

/// §4.5.2 — PRE_ACCEPT handler (follower role).
pub(crate) fn handle_pre_accept(r: &Replica, msg: Message) {
    let key = msg.key.clone();
    let (local_seq, local_ballot) = r.log.last_seq_for_key(&key);
    if msg.seq == local_seq && msg.ballot == local_ballot {
        // Already committed under this exact (ballot, seq); nothing to do.
        return;
    }

    let guard = r.state_lock.lock();

    let existing = r.commands.get(&key);
    let (cmd, mut interfering, recover_replica) = match existing {
        Some(cmd) => {
            let (stale, prev_status, prev_ballot, interfering) = {
                let mut inner = cmd.lock();
                if msg.ballot < inner.ballot {
                    (true, inner.status, inner.ballot, 0)
                } else {
                    let prev_status = inner.status;
                    let prev_ballot = inner.ballot;
                    inner.ballot = inner.ballot.max(msg.ballot);
                    (false, prev_status, prev_ballot, inner.seq)
                }
            };
            if stale {
                drop(guard);
                return;
            }
            let recover_replica = if prev_status == Status::Accepted
                && prev_ballot.replica() != msg.ballot.replica()
            {
                Some(prev_ballot.replica())
            } else {
                None
            };
            (cmd, interfering, recover_replica)
        }
        None => {
            let new_cmd = Arc::new(Command::new(
                0,
                key.clone(),
                Vec::new(),
                msg.seq,
                msg.ballot,
                Status::PreAccepted,
                r.timeout,
            ));
            r.commands.insert_evicting(key.clone(), Arc::clone(&new_cmd));
            (new_cmd, 0u64, None)
        }
    };

    interfering = local_seq.max(interfering);
    let max_seq = msg.seq.max(interfering);

    let seq_is_current = msg.seq >= interfering;
    if seq_is_current {
        let mut inner = cmd.lock();
        inner.status = Status::PreAccepted;
        inner.seq = interfering;
        inner.timestamp = Instant::now();
    }

    let response_ballot = cmd.lock().ballot;
    drop(guard);

    if seq_is_current {
        if let Some(replica_idx) = recover_replica {
            r.trigger_recover(replica_idx, &key, msg.seq, msg.ballot);
        }
    }

    let committed = max_seq == local_seq;
    let response = crate::codec::Message::response(
        MessageType::PreAcceptResponse,
        r.my_name(),
        response_ballot,
        key,
        max_seq,
        committed,
    );
    r.send_to(&msg.sender, &response);
}

enum PreAcceptDecision {
    None,
    FastCommit { seq: u64, ballot: Ballot },
    SlowAccept { seq: u64, ballot: Ballot },
}

/// §4.5.3 — PRE_ACCEPT_RESPONSE handler (leader role).
pub(crate) fn handle_pre_accept_response(r: &Replica, msg: Message) {
    let key = msg.key.clone();
    let guard = r.state_lock.lock();

    let cmd = match r.commands.get(&key) {
        Some(c) => c,
        None => {
            drop(guard);
            return;
        }
    };

    let decision = {
        let mut inner = cmd.lock();
        if msg.ballot < inner.ballot || inner.status != Status::PreAccepted {
            PreAcceptDecision::None
        } else {
            inner.votes.push(Vote {
                peer: msg.sender.clone(),
                seq: msg.seq,
                ballot: msg.ballot,
            });

            if msg.seq > inner.max_seq {
                inner.max_seq = msg.seq;
                inner.max_seq_committed = msg.committed;
            } else if msg.seq == inner.max_seq {
                inner.max_seq_committed |= msg.committed;
            }

            if inner.votes.len() < required_votes(r.peers.len()) {
                PreAcceptDecision::None
            } else {
                let fast_path =
                    inner.seq > inner.max_seq || (inner.seq == inner.max_seq && !inner.max_seq_committed);
                if fast_path {
                    PreAcceptDecision::FastCommit {
                        seq: inner.seq,
                        ballot: inner.ballot,
                    }
                } else {
                    inner.seq = inner.max_seq + 1;
                    inner.ballot = r.ballot.current();
                    inner.votes.clear();
                    inner.max_seq = 0;
                    inner.max_seq_committed = false;
                    inner.status = Status::Accepted;
                    inner.timestamp = Instant::now();
                    PreAcceptDecision::SlowAccept {
                        seq: inner.seq,
                        ballot: inner.ballot,
                    }
                }
            }
        }
    };

    match decision {
        PreAcceptDecision::None => drop(guard),
        PreAcceptDecision::FastCommit { seq, ballot } => {
            r.commands.remove_if_same(&key, &cmd);
            drop(guard);
            r.commit(cmd, ballot, seq);
        }
        PreAcceptDecision::SlowAccept { seq, ballot } => {
            drop(guard);
            let accept = Message::control(MessageType::Accept, r.my_name(), ballot, key, seq);
            r.broadcast(&accept);
        }
    }
}

/// §4.5.4 — ACCEPT handler (follower role).
pub(crate) fn handle_accept(r: &Replica, msg: Message) {
    let key = msg.key.clone();
    let (local_seq, _local_ballot) = r.log.last_seq_for_key(&key);
    let guard = r.state_lock.lock();

    let existing = r.commands.get(&key);
    let cmd = match existing {
        Some(cmd) => {
            let stale = msg.ballot < cmd.lock().ballot;
            if stale {
                drop(guard);
                return;
            }
            cmd
        }
        None => {
            let new_cmd = Arc::new(Command::new(
                0,
                key.clone(),
                Vec::new(),
                0,
                Ballot::zero(),
                Status::PreAccepted,
                r.timeout,
            ));
            r.commands.insert_evicting(key.clone(), Arc::clone(&new_cmd));
            new_cmd
        }
    };

    let (resp_ballot, resp_seq) = {
        let mut inner = cmd.lock();
        if msg.seq >= inner.seq {
            inner.seq = msg.seq;
            inner.ballot = msg.ballot;
            inner.status = Status::Accepted;
            inner.timestamp = Instant::now();
        }
        (inner.ballot, inner.seq)
    };
    drop(guard);

    let committed = resp_seq == local_seq;
    let response = Message::response(
        MessageType::AcceptResponse,
        r.my_name(),
        resp_ballot,
        key,
        resp_seq,
        committed,
    );
    r.send_to(&msg.sender, &response);
}

enum AcceptDecision {
    None,
    Commit { seq: u64, ballot: Ballot },
    Rebroadcast { seq: u64, ballot: Ballot },
}

/// §4.5.5 — ACCEPT_RESPONSE handler (leader role).
pub(crate) fn handle_accept_response(r: &Replica, msg: Message) {
    let key = msg.key.clone();
    let guard = r.state_lock.lock();

    let cmd = match r.commands.get(&key) {
        Some(c) => c,
        None => {
            drop(guard);
            return;
        }
    };

    let decision = {
        let mut inner = cmd.lock();
        if msg.ballot < inner.ballot || inner.status != Status::Accepted {
            AcceptDecision::None
        } else if msg.seq == inner.seq && msg.committed {
            // Another command for this key already committed this seq
            // under us; bump past it and retry the accept round.
            inner.seq += 1;
            inner.ballot = r.ballot.current();
            inner.votes.clear();
            inner.timestamp = Instant::now();
            AcceptDecision::Rebroadcast {
                seq: inner.seq,
                ballot: inner.ballot,
            }
        } else {
            inner.votes.push(Vote {
                peer: msg.sender.clone(),
                seq: msg.seq,
                ballot: msg.ballot,
            });
            inner.max_seq = inner.max_seq.max(msg.seq);

            let required = required_votes(r.peers.len());
            let count_ok = inner
                .votes
                .iter()
                .filter(|v| v.seq == msg.seq && v.ballot == msg.ballot)
                .count();

            if count_ok >= required {
                AcceptDecision::Commit {
                    seq: inner.seq,
                    ballot: inner.ballot,
                }
            } else if inner.votes.len() >= required {
                if inner.seq <= inner.max_seq {
                    inner.seq += 1;
                }
                inner.ballot = r.ballot.current();
                inner.votes.clear();
                inner.timestamp = Instant::now();
                AcceptDecision::Rebroadcast {
                    seq: inner.seq,
                    ballot: inner.ballot,
                }
            } else {
                AcceptDecision::None
            }
        }
    };

    match decision {
        AcceptDecision::None => drop(guard),
        AcceptDecision::Commit { seq, ballot } => {
            r.commands.remove_if_same(&key, &cmd);
            drop(guard);
            r.commit(cmd, ballot, seq);
        }
        AcceptDecision::Rebroadcast { seq, ballot } => {
            drop(guard);
            let accept = Message::control(MessageType::Accept, r.my_name(), ballot, key, seq);
            r.broadcast(&accept);
        }
    }
}

/// §4.5.7 — COMMIT handler (follower role).
pub(crate) fn handle_commit(r: &Replica, msg: Message) {
    let key = msg.key.clone();

    {
        let guard = r.state_lock.lock();
        if let Some(cmd) = r.commands.get(&key) {
            let inner = cmd.lock();
            if inner.seq == msg.seq && inner.ballot > msg.ballot {
                drop(inner);
                drop(guard);
                return;
            }
        }
        let (local_seq, _) = r.log.last_seq_for_key(&key);
        if msg.seq < local_seq {
            drop(guard);
            return;
        }
    }

    // Invoke the commit handler without the replica lock held.
    (r.callbacks.commit)(msg.ctype, &msg.key, &msg.data, false);
    r.log.set_last_seq_for_key(&key, msg.ballot, msg.seq);

    let guard = r.state_lock.lock();
    if let Some(cmd) = r.commands.get(&key) {
        let matches = cmd.lock().seq <= msg.seq;
        if matches {
            // Removing our table reference is enough: a blocked waiter (if
            // any) holds its own `Arc<Command>` from `submit` and drops it
            // independently when it wakes — the Rust analogue of "waiters
            // destroy their own" from the design notes.
            r.commands.remove_if_same(&key, &cmd);
        }
    }
    drop(guard);
}
