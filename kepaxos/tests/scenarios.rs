//! Integration tests against an in-process mock transport: the six seed
//! scenarios from the spec's testable-properties section, run over a
//! 5-replica cluster (`node1`..`node5`, indices 0..4).

use kepaxos::replica::{Callbacks, Replica};
use kepaxos::storage::{Log, MemoryLog};
use kepaxos::{Ballot, ReplicaConfig, SubmitError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Cluster {
    replicas: HashMap<String, Arc<Replica>>,
    logs: HashMap<String, Arc<MemoryLog>>,
    online: Arc<Mutex<HashMap<String, bool>>>,
    commit_log: Arc<Mutex<Vec<(String, u8, Vec<u8>, Vec<u8>)>>>,
    send_calls: Arc<Mutex<Vec<usize>>>,
}

const NAMES: [&str; 5] = ["node1", "node2", "node3", "node4", "node5"];

impl Cluster {
    fn new(timeout_secs: u64) -> Self {
        let online: Arc<Mutex<HashMap<String, bool>>> = Arc::new(Mutex::new(
            NAMES.iter().map(|n| (n.to_string(), true)).collect(),
        ));
        let commit_log = Arc::new(Mutex::new(Vec::new()));
        let send_calls = Arc::new(Mutex::new(Vec::new()));
        let registry: Arc<Mutex<HashMap<String, Arc<Replica>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut logs = HashMap::new();
        let mut replicas = HashMap::new();

        for (i, name) in NAMES.iter().enumerate() {
            let log = Arc::new(MemoryLog::new());
            let peers: Vec<String> = NAMES.iter().map(|s| s.to_string()).collect();
            let cfg = ReplicaConfig::new(i as u8, peers, format!("{name}.db"), timeout_secs).unwrap();

            let registry_for_send = Arc::clone(&registry);
            let online_for_send = Arc::clone(&online);
            let send_calls_for_send = Arc::clone(&send_calls);
            let send: Arc<dyn Fn(&[String], &[u8]) -> i32 + Send + Sync> =
                Arc::new(move |recipients: &[String], payload: &[u8]| {
                    send_calls_for_send.lock().unwrap().push(recipients.len());
                    for recipient in recipients {
                        let is_online = *online_for_send
                            .lock()
                            .unwrap()
                            .get(recipient)
                            .unwrap_or(&false);
                        if !is_online {
                            continue;
                        }
                        let registry = Arc::clone(&registry_for_send);
                        let recipient = recipient.clone();
                        let payload = payload.to_vec();
                        std::thread::spawn(move || {
                            if let Some(target) = registry.lock().unwrap().get(&recipient).cloned() {
                                let _ = target.handle_wire_message(&payload);
                            }
                        });
                    }
                    0
                });

            let commit_log_for_commit = Arc::clone(&commit_log);
            let my_name = name.to_string();
            let commit: Arc<dyn Fn(u8, &[u8], &[u8], bool) -> i32 + Send + Sync> =
                Arc::new(move |ctype, key: &[u8], data: &[u8], _leader| {
                    commit_log_for_commit.lock().unwrap().push((
                        my_name.clone(),
                        ctype,
                        key.to_vec(),
                        data.to_vec(),
                    ));
                    0
                });

            let recover: Arc<dyn Fn(&str, &[u8], u64, Ballot) -> i32 + Send + Sync> =
                Arc::new(|_peer: &str, _key: &[u8], _seq: u64, _ballot: Ballot| 0);

            let replica = Replica::new(
                cfg,
                Arc::clone(&log) as Arc<dyn Log>,
                Callbacks {
                    send,
                    commit,
                    recover,
                },
            )
            .unwrap();

            registry
                .lock()
                .unwrap()
                .insert(name.to_string(), Arc::clone(&replica));
            replicas.insert(name.to_string(), replica);
            logs.insert(name.to_string(), log);
        }

        Cluster {
            replicas,
            logs,
            online,
            commit_log,
            send_calls,
        }
    }

    fn set_online(&self, name: &str, is_online: bool) {
        self.online.lock().unwrap().insert(name.to_string(), is_online);
    }

    fn submit(&self, at: &str, ctype: u8, key: &[u8], data: &[u8]) -> Result<(), SubmitError> {
        self.replicas[at].submit(ctype, key.to_vec(), data.to_vec())
    }

    fn seq(&self, name: &str, key: &[u8]) -> u64 {
        self.logs[name].last_seq_for_key(key).0
    }

    fn entry(&self, name: &str, key: &[u8]) -> (u64, Ballot) {
        let (seq, ballot) = self.logs[name].last_seq_for_key(key);
        (seq, ballot)
    }

    fn commit_count(&self) -> usize {
        self.commit_log.lock().unwrap().len()
    }
}

/// Scenario 1: only node1 is online; submit times out after ~1s and the
/// transport is asked to deliver to the 4 other peers exactly once.
#[test]
fn timeout_with_single_replica_online() {
    let cluster = Cluster::new(1);
    for name in &NAMES[1..] {
        cluster.set_online(name, false);
    }

    let result = cluster.submit("node1", 0x00, b"test_key", b"test_value");
    assert_eq!(result, Err(SubmitError::Timeout));

    let calls = cluster.send_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], 4);
}

/// Scenario 2: all five replicas up; commit fires once per replica and all
/// logs agree on `(ballot >= 1, seq = 1)`.
#[test]
fn happy_path_broadcast() {
    let cluster = Cluster::new(1);

    let result = cluster.submit("node1", 0x00, b"test_key", b"test_value");
    assert_eq!(result, Ok(()));

    // Give follower-side COMMIT handling a moment to land.
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(cluster.commit_count(), 5);
    let first = cluster.entry("node1", b"test_key");
    assert!(first.1.raw() >= 1);
    assert_eq!(first.0, 1);
    for name in &NAMES {
        assert_eq!(cluster.entry(name, b"test_key"), first);
    }
}

/// Scenario 3: node4/node5 offline; submit still succeeds over the
/// remaining majority, and the offline replicas' logs lag behind.
#[test]
fn minority_failure_still_commits() {
    let cluster = Cluster::new(1);
    cluster.set_online("node4", false);
    cluster.set_online("node5", false);

    let result = cluster.submit("node1", 0x00, b"test_key", b"test_value");
    assert_eq!(result, Ok(()));
    std::thread::sleep(Duration::from_millis(200));

    let agreed = cluster.entry("node1", b"test_key");
    assert_eq!(agreed.0, 1);
    for name in &["node1", "node2", "node3"] {
        assert_eq!(cluster.entry(name, b"test_key"), agreed);
    }
    for name in &["node4", "node5"] {
        assert_ne!(cluster.entry(name, b"test_key"), agreed);
    }
}

/// Scenario 4: additionally node3 offline, leaving only node1/node2 up —
/// below a majority — so a second key fails to commit anywhere.
#[test]
fn majority_lost_fails() {
    let cluster = Cluster::new(1);
    cluster.set_online("node3", false);
    cluster.set_online("node4", false);
    cluster.set_online("node5", false);

    let before = cluster.commit_count();
    let result = cluster.submit("node1", 0x00, b"other_key", b"v");
    assert_eq!(result, Err(SubmitError::Timeout));
    assert_eq!(cluster.commit_count(), before);
}

/// Scenario 5: bring the rest of the cluster back and submit the same key
/// from a replica that missed the earlier commit (node4); the slow path
/// must converge all five replicas on one `(ballot, seq)`.
#[test]
fn catch_up_via_slow_path() {
    let cluster = Cluster::new(1);
    cluster.set_online("node4", false);
    cluster.set_online("node5", false);
    assert_eq!(
        cluster.submit("node1", 0x00, b"test_key", b"test_value"),
        Ok(())
    );
    std::thread::sleep(Duration::from_millis(200));

    cluster.set_online("node4", true);
    cluster.set_online("node5", true);

    let result = cluster.submit("node4", 0x00, b"test_key", b"new_value");
    assert_eq!(result, Ok(()));
    std::thread::sleep(Duration::from_millis(300));

    let agreed = cluster.entry("node1", b"test_key");
    for name in &NAMES {
        assert_eq!(cluster.entry(name, b"test_key"), agreed);
    }
}

/// Scenario 6: two threads hammer the same key from random replicas
/// concurrently; every replica must converge on one final `(ballot, seq)`.
#[test]
fn concurrent_contention_converges() {
    let cluster = Arc::new(Cluster::new(2));
    let key = b"contended".to_vec();

    let run = |cluster: Arc<Cluster>, key: Vec<u8>| {
        std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..10u8 {
                let replica = NAMES[rng.gen_range(0..NAMES.len())];
                let _ = cluster.submit(replica, 0x00, &key, &[i]);
            }
        })
    };

    let t1 = run(Arc::clone(&cluster), key.clone());
    let t2 = run(Arc::clone(&cluster), key.clone());
    t1.join().unwrap();
    t2.join().unwrap();

    std::thread::sleep(Duration::from_millis(500));

    let agreed = cluster.entry("node1", &key);
    for name in &NAMES {
        assert_eq!(cluster.entry(name, &key), agreed, "replica {name} disagrees");
    }
}
