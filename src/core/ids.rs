//! Canonical identifier types shared by the locking and commit layers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque cache key.
pub type Key = Bytes;

/// Opaque cache value.
pub type Value = Bytes;

/// Monotonic cluster topology identifier.
pub type TopologyId = u64;

/// Segment index a key hashes into.
pub type SegmentId = u32;

/// Cluster member identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Cluster-wide transaction identifier: originating node plus a node-local sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalTxId {
    pub origin: NodeId,
    pub id: u64,
}

impl GlobalTxId {
    pub fn new(origin: NodeId, id: u64) -> Self {
        Self { origin, id }
    }
}

impl std::fmt::Display for GlobalTxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GTX[{}:{}]", self.origin, self.id)
    }
}

/// Synthetic identifier of a single non-transactional command invocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId {
    pub origin: NodeId,
    pub id: u64,
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CMD[{}:{}]", self.origin, self.id)
    }
}

/// The entity a lock belongs to.
///
/// One owner may hold locks on many keys; a key has at most one owner at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockOwner {
    Transaction(GlobalTxId),
    Command(CommandId),
}

impl LockOwner {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transaction(gtx) => gtx.fmt(f),
            Self::Command(cmd) => cmd.fmt(f),
        }
    }
}

/// Allocates transaction and command identifiers for one node.
#[derive(Debug)]
pub struct IdGenerator {
    node: NodeId,
    next_tx: AtomicU64,
    next_command: AtomicU64,
}

impl IdGenerator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next_tx: AtomicU64::new(1),
            next_command: AtomicU64::new(1),
        }
    }

    pub fn next_tx(&self) -> GlobalTxId {
        GlobalTxId::new(self.node.clone(), self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_command(&self) -> CommandId {
        CommandId {
            origin: self.node.clone(),
            id: self.next_command.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Render a key for log fields and error messages.
pub fn display_key(key: &Key) -> String {
    String::from_utf8_lossy(key).into_owned()
}
