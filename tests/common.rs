//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Weak};
use tempfile::NamedTempFile;
use tessera::control::rpc::RpcManager;
use tessera::control::topology::{ClusterTopology, TopologySnapshot};
use tessera::core::config::{CacheMode, Config, TransactionMode};
use tessera::core::error::{GridError, GridResult};
use tessera::core::ids::{Key, NodeId};
use tessera::locking::command::{Command, CommandResult};
use tessera::{Cache, CacheBuilder, Collaborators};

/// A command one node sent to another.
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub from: NodeId,
    pub to: NodeId,
    pub command: Command,
}

type Registry = Arc<RwLock<HashMap<NodeId, Weak<Cache>>>>;

/// Delivers commands by calling the target cache directly and records them.
pub struct InProcessRpc {
    from: NodeId,
    registry: Registry,
    log: Arc<Mutex<Vec<SentCommand>>>,
}

#[async_trait]
impl RpcManager for InProcessRpc {
    async fn invoke_remotely(
        &self,
        target: &NodeId,
        command: Command,
    ) -> GridResult<CommandResult> {
        self.log.lock().push(SentCommand {
            from: self.from.clone(),
            to: target.clone(),
            command: command.clone(),
        });
        let cache = self
            .registry
            .read()
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| GridError::remote(target, "node not reachable"))?;
        cache.handle_remote(command).await
    }
}

/// Several caches wired to each other in one process.
pub struct TestCluster {
    pub nodes: Vec<Arc<Cache>>,
    pub topologies: Vec<Arc<ClusterTopology>>,
    pub snapshot: TopologySnapshot,
    log: Arc<Mutex<Vec<SentCommand>>>,
}

impl TestCluster {
    /// Build one cache per member of `snapshot`, each configured by `configure`.
    pub fn start(
        snapshot: TopologySnapshot,
        cache_mode: CacheMode,
        configure: impl Fn(&mut Config),
    ) -> Self {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut nodes = Vec::new();
        let mut topologies = Vec::new();

        for member in &snapshot.members {
            let mut config = Config::for_node(member.as_str(), cache_mode);
            config.cluster.num_segments = snapshot.num_segments();
            configure(&mut config);

            let topology = Arc::new(ClusterTopology::new(member.clone(), snapshot.clone()));
            let rpc = Arc::new(InProcessRpc {
                from: member.clone(),
                registry: registry.clone(),
                log: log.clone(),
            });
            let cache = CacheBuilder::new(config)
                .expect("valid config")
                .wire(Collaborators::clustered(topology.clone(), rpc))
                .expect("wired cache");
            let cache = Arc::new(cache);
            registry
                .write()
                .insert(member.clone(), Arc::downgrade(&cache));
            nodes.push(cache);
            topologies.push(topology);
        }

        Self {
            nodes,
            topologies,
            snapshot,
            log,
        }
    }

    pub fn node(&self, name: &str) -> &Arc<Cache> {
        self.nodes
            .iter()
            .find(|cache| cache.node().as_str() == name)
            .expect("known node")
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// First generated key whose owners are exactly `owners`, primary first.
    pub fn key_owned_by(&self, owners: &[&str]) -> Key {
        key_owned_by(&self.snapshot, owners)
    }
}

pub fn nodes(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|name| NodeId::new(*name)).collect()
}

pub fn key_owned_by(snapshot: &TopologySnapshot, owners: &[&str]) -> Key {
    let wanted = nodes(owners);
    (0..10_000)
        .map(|i| Key::from(format!("key-{i:05}")))
        .find(|key| {
            snapshot
                .owners(snapshot.segment_for(key))
                .is_some_and(|segment| segment.owners == wanted)
        })
        .expect("a key with the requested owners")
}

/// A wired single-node cache.
pub fn local_cache(mode: TransactionMode, configure: impl Fn(&mut Config)) -> Cache {
    let mut config = Config::for_node("local", CacheMode::Local);
    config.transaction.mode = mode;
    config.locking.acquire_timeout_ms = 100;
    configure(&mut config);
    let segments = config.cluster.num_segments;
    CacheBuilder::new(config)
        .expect("valid config")
        .wire(Collaborators::local(NodeId::new("local"), segments))
        .expect("wired cache")
}

/// Write `content` to a temporary TOML file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Minimal valid configuration for one node.
pub fn create_minimal_config() -> NamedTempFile {
    config_file(
        r#"
[cluster]
node_id = "node-1"
cache_mode = "distributed"
"#,
    )
}

/// Assert that a result is Err and return the error.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}
