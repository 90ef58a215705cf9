//! Multi-node tests over an in-process transport.

mod common;

use bytes::Bytes;
use common::{nodes, TestCluster};
use tessera::control::topology::{TopologyOracle, TopologySnapshot};
use tessera::core::config::{CacheMode, TransactionMode};
use tessera::core::ids::{Key, LockOwner};
use tessera::locking::command::{
    ClearCommand, Command, CommandFlags, CommitCommand, PrepareCommand, PutMapCommand,
    WriteCommand,
};
use tessera::Cache;

fn pessimistic_cluster() -> TestCluster {
    let snapshot = TopologySnapshot::balanced(1, nodes(&["a", "b", "c"]), 32, 2);
    TestCluster::start(snapshot, CacheMode::Distributed, |config| {
        config.transaction.mode = TransactionMode::Pessimistic;
        config.locking.acquire_timeout_ms = 100;
    })
}

fn optimistic_cluster(one_phase: bool) -> TestCluster {
    let snapshot = TopologySnapshot::balanced(1, nodes(&["a", "b"]), 32, 2);
    TestCluster::start(snapshot, CacheMode::Distributed, |config| {
        config.transaction.mode = TransactionMode::Optimistic;
        config.transaction.use_one_phase_commit = one_phase;
        config.locking.acquire_timeout_ms = 100;
    })
}

async fn commit_value(cache: &Cache, key: &Key, value: &'static str) {
    let tx = cache.begin_transaction().unwrap();
    cache
        .put(&mut cache.tx_context(&tx), key.clone(), value)
        .await
        .unwrap();
    cache.commit(&tx).await.unwrap();
}

fn values(cluster: &TestCluster, key: &Key) -> Vec<Option<Bytes>> {
    cluster
        .nodes
        .iter()
        .map(|cache| cache.container().peek(key).map(|entry| entry.value))
        .collect()
}

fn lock_controls(cluster: &TestCluster) -> Vec<(String, String, bool)> {
    cluster
        .sent()
        .into_iter()
        .filter_map(|sent| match sent.command {
            Command::LockControl(lock) => Some((
                sent.from.to_string(),
                sent.to.to_string(),
                lock.unlock,
            )),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Pessimistic remote locking
// ============================================================================

#[tokio::test]
async fn backup_owner_locks_on_primary_first() {
    let cluster = pessimistic_cluster();
    let key = cluster.key_owned_by(&["b", "a"]);
    let a = cluster.node("a");
    let b = cluster.node("b");

    let tx = a.begin_transaction().unwrap();
    let mut ctx = a.tx_context(&tx);
    a.put(&mut ctx, key.clone(), "v").await.unwrap();

    assert_eq!(
        lock_controls(&cluster),
        vec![("a".to_string(), "b".to_string(), false)]
    );
    assert_eq!(
        b.lock_manager().owner_of(&key),
        Some(LockOwner::Transaction(tx.gtx().clone()))
    );
    assert!(tx.has_backup_lock(&key));
    assert!(!a.lock_manager().is_locked(&key));

    // A second write to the same key needs no further request.
    a.put(&mut ctx, key.clone(), "w").await.unwrap();
    assert_eq!(lock_controls(&cluster).len(), 1);

    a.commit(&tx).await.unwrap();

    assert!(!b.lock_manager().is_locked(&key));
    assert!(b.transactions().is_empty());
    assert!(a.transactions().is_empty());
    for name in ["a", "b"] {
        let cache = cluster.node(name);
        assert_eq!(
            cache.container().peek(&key).map(|entry| entry.value),
            Some(Bytes::from("w"))
        );
    }
    assert!(!cluster.node("c").container().contains(&key));
}

#[tokio::test]
async fn remote_lock_conflict_times_out() {
    let cluster = pessimistic_cluster();
    let key = cluster.key_owned_by(&["b", "a"]);
    let a = cluster.node("a");
    let c = cluster.node("c");

    let first = a.begin_transaction().unwrap();
    a.put(&mut a.tx_context(&first), key.clone(), "1")
        .await
        .unwrap();

    let second = c.begin_transaction().unwrap();
    let err = c
        .put(&mut c.tx_context(&second), key.clone(), "2")
        .await
        .unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(!second.contains_affected_key(&key));

    a.rollback(&first).await.unwrap();
    assert!(!cluster.node("b").lock_manager().is_locked(&key));

    c.put(&mut c.tx_context(&second), key.clone(), "2")
        .await
        .unwrap();
    c.commit(&second).await.unwrap();
    assert_eq!(
        cluster.node("b").container().peek(&key).map(|entry| entry.value),
        Some(Bytes::from("2"))
    );
}

#[tokio::test]
async fn failed_multi_owner_lock_releases_earlier_owners() {
    let cluster = pessimistic_cluster();
    let on_b = cluster.key_owned_by(&["b", "c"]);
    let on_c = cluster.key_owned_by(&["c", "a"]);
    let a = cluster.node("a");
    let b = cluster.node("b");
    let c = cluster.node("c");

    // Hold the key owned by c from another transaction.
    let blocker = c.begin_transaction().unwrap();
    c.put(&mut c.tx_context(&blocker), on_c.clone(), "x")
        .await
        .unwrap();

    let tx = a.begin_transaction().unwrap();
    let mut ctx = a.tx_context(&tx);
    let command = Command::PutMap(PutMapCommand {
        entries: vec![
            (on_b.clone(), Bytes::from("1")),
            (on_c.clone(), Bytes::from("2")),
        ],
        metadata: Default::default(),
        flags: CommandFlags::empty(),
    });
    let err = a.invoke(&mut ctx, command).await.unwrap_err();

    assert!(err.is_lock_timeout());
    assert!(!b.lock_manager().is_locked(&on_b));
    assert_eq!(
        c.lock_manager().owner_of(&on_c),
        Some(LockOwner::Transaction(blocker.gtx().clone()))
    );
    assert!(lock_controls(&cluster)
        .iter()
        .any(|(from, to, unlock)| from == "a" && to == "b" && *unlock));
}

// ============================================================================
// Non-transactional routing
// ============================================================================

#[tokio::test]
async fn non_owner_write_is_forwarded_to_primary() {
    let snapshot = TopologySnapshot::balanced(1, nodes(&["a", "b", "c"]), 32, 2);
    let cluster = TestCluster::start(snapshot, CacheMode::Distributed, |_| {});
    let key = cluster.key_owned_by(&["a", "b"]);
    let c = cluster.node("c");

    let mut ctx = c.non_tx_context();
    c.put(&mut ctx, key.clone(), "v").await.unwrap();

    for name in ["a", "b"] {
        assert!(cluster.node(name).container().contains(&key));
        assert!(!cluster.node(name).lock_manager().is_locked(&key));
    }
    assert!(!c.container().contains(&key));

    let writes: Vec<(String, String, bool)> = cluster
        .sent()
        .into_iter()
        .filter_map(|sent| match sent.command {
            Command::Write(write) => Some((
                sent.from.to_string(),
                sent.to.to_string(),
                write.flags.contains(CommandFlags::CACHE_MODE_LOCAL),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        writes,
        vec![
            ("c".to_string(), "a".to_string(), false),
            ("a".to_string(), "b".to_string(), true),
        ]
    );

    let mut reader = cluster.node("b").non_tx_context();
    assert_eq!(
        cluster.node("b").get(&mut reader, key).await.unwrap(),
        Some(Bytes::from("v"))
    );
}

#[tokio::test]
async fn replicated_write_reaches_every_member() {
    let snapshot = TopologySnapshot::replicated(1, nodes(&["a", "b", "c"]), 16);
    let cluster = TestCluster::start(snapshot, CacheMode::Replicated, |_| {});

    let b = cluster.node("b");
    let mut ctx = b.non_tx_context();
    b.put(&mut ctx, "k", "v").await.unwrap();

    for cache in &cluster.nodes {
        assert!(cache.container().contains(&Bytes::from("k")));
    }
}

#[tokio::test]
async fn invalidation_drops_peer_copies() {
    let snapshot = TopologySnapshot::balanced(1, nodes(&["a", "b"]), 16, 1);
    let cluster = TestCluster::start(snapshot, CacheMode::Invalidation, |_| {});
    let a = cluster.node("a");
    let b = cluster.node("b");
    let key = Bytes::from("k");

    b.put(&mut b.non_tx_context(), key.clone(), "old")
        .await
        .unwrap();
    assert!(b.container().contains(&key));
    assert!(!a.container().contains(&key));

    a.put(&mut a.non_tx_context(), key.clone(), "new")
        .await
        .unwrap();

    assert_eq!(
        a.container().peek(&key).map(|entry| entry.value),
        Some(Bytes::from("new"))
    );
    assert!(!b.container().contains(&key));
    assert!(!b.lock_manager().is_locked(&key));
}

#[tokio::test]
async fn clear_reaches_every_member() {
    let snapshot = TopologySnapshot::replicated(1, nodes(&["a", "b"]), 16);
    let cluster = TestCluster::start(snapshot, CacheMode::Replicated, |_| {});
    let a = cluster.node("a");

    let mut ctx = a.non_tx_context();
    for i in 0..5 {
        a.put(&mut ctx, format!("k{i}"), "v").await.unwrap();
    }
    assert_eq!(cluster.node("b").container().len(), 5);

    a.clear(&mut ctx).await.unwrap();

    for cache in &cluster.nodes {
        assert!(cache.container().is_empty());
    }
}

// ============================================================================
// Topology
// ============================================================================

#[tokio::test]
async fn stale_topology_install_is_rejected() {
    let cluster = pessimistic_cluster();
    let topology = &cluster.topologies[0];

    let newer = TopologySnapshot::balanced(2, nodes(&["a", "b", "c"]), 32, 2);
    topology.install(newer).unwrap();
    assert_eq!(topology.topology_id(), 2);

    let older = TopologySnapshot::balanced(2, nodes(&["a", "b", "c"]), 32, 2);
    let err = topology.install(older).unwrap_err();
    assert!(err.is_topology_retry());
}

// ============================================================================
// Optimistic transactions across owners
// ============================================================================

#[tokio::test]
async fn stale_read_on_backup_is_rejected_by_primary() {
    let cluster = optimistic_cluster(false);
    let key = cluster.key_owned_by(&["b", "a"]);
    let a = cluster.node("a");
    let b = cluster.node("b");
    commit_value(b, &key, "v1").await;

    let stale = a.begin_transaction().unwrap();
    let mut ctx = a.tx_context(&stale);
    assert_eq!(
        a.get(&mut ctx, key.clone()).await.unwrap(),
        Some(Bytes::from("v1"))
    );
    commit_value(b, &key, "v2").await;

    a.put(&mut ctx, key.clone(), "mine").await.unwrap();
    let err = a.commit(&stale).await.unwrap_err();
    assert!(err.is_write_skew());
    assert_eq!(values(&cluster, &key), vec![Some(Bytes::from("v2")); 2]);
    assert!(!b.lock_manager().is_locked(&key));

    // A fresh read of the current value commits.
    let fresh = a.begin_transaction().unwrap();
    let mut ctx = a.tx_context(&fresh);
    a.get(&mut ctx, key.clone()).await.unwrap();
    a.put(&mut ctx, key.clone(), "mine").await.unwrap();
    a.commit(&fresh).await.unwrap();
    assert_eq!(values(&cluster, &key), vec![Some(Bytes::from("mine")); 2]);
}

#[tokio::test]
async fn one_phase_commit_rejected_by_primary_changes_nothing() {
    let cluster = optimistic_cluster(true);
    let key = cluster.key_owned_by(&["b", "a"]);
    let a = cluster.node("a");
    let b = cluster.node("b");
    commit_value(b, &key, "orig").await;

    // Hold the primary's lock with a prepared two-phase transaction.
    let holder = b.begin_transaction().unwrap();
    let mut holder_ctx = b.tx_context(&holder);
    b.put(&mut holder_ctx, key.clone(), "held").await.unwrap();
    let prepare = PrepareCommand::new(
        holder.gtx().clone(),
        holder.modified_keys(),
        false,
        holder.topology_id(),
    );
    b.invoke(&mut holder_ctx, Command::Prepare(prepare))
        .await
        .unwrap();
    assert!(b.lock_manager().is_locked(&key));

    let tx = a.begin_transaction().unwrap();
    a.put(&mut a.tx_context(&tx), key.clone(), "lost")
        .await
        .unwrap();
    let err = a.commit(&tx).await.unwrap_err();
    assert!(err.is_lock_timeout());
    assert_eq!(values(&cluster, &key), vec![Some(Bytes::from("orig")); 2]);

    let commit = CommitCommand {
        gtx: holder.gtx().clone(),
        topology_id: holder.topology_id(),
    };
    b.invoke(&mut holder_ctx, Command::Commit(commit))
        .await
        .unwrap();
    assert_eq!(values(&cluster, &key), vec![Some(Bytes::from("held")); 2]);
    assert!(!b.lock_manager().is_locked(&key));
}

// ============================================================================
// Remote handling
// ============================================================================

fn assert_send<T: Send>(_: &T) {}

#[test]
fn remote_handling_can_run_on_any_worker() {
    let snapshot = TopologySnapshot::balanced(1, nodes(&["a", "b"]), 16, 2);
    let cluster = TestCluster::start(snapshot, CacheMode::Distributed, |_| {});
    let a = cluster.node("a");

    let write = a.handle_remote(Command::Write(WriteCommand::put("k", "v")));
    assert_send(&write);
    let clear = a.handle_remote(Command::Clear(ClearCommand::default()));
    assert_send(&clear);
}
