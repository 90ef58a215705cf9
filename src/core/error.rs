//! Error types for the locking and commit core.
//!
//! Callers see a normal result, a lock timeout, a write-skew conflict, or an
//! invalid-usage error. `OutdatedTopology` is the one failure that must never
//! trigger lock release: the command is resubmitted and reuses the locks.

use crate::core::ids::{display_key, GlobalTxId, Key, LockOwner, NodeId, TopologyId};
use thiserror::Error;

/// Common grid error conditions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    /// A key could not be locked within the timeout budget.
    #[error("unable to acquire lock on key {key} for {owner} after {timeout_ms} ms")]
    LockTimeout {
        key: String,
        owner: String,
        timeout_ms: u64,
    },

    /// An optimistic transaction read a value that has since been changed.
    #[error("write skew detected on key {key} for transaction {tx}")]
    WriteSkew { key: String, tx: String },

    /// The command was issued under an older topology and must be retried.
    #[error("outdated topology: command topology {requested}, current {current}")]
    OutdatedTopology {
        requested: TopologyId,
        current: TopologyId,
    },

    /// The API was used in a way the active locking strategy does not allow.
    #[error("invalid usage: {message}")]
    InvalidUsage { message: String },

    /// A remote node failed to execute a command.
    #[error("remote failure on {node}: {message}")]
    Remote { node: String, message: String },

    /// Storage or persistence collaborator failure.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GridError {
    /// Create a LockTimeout error.
    pub fn lock_timeout(key: &Key, owner: &LockOwner, timeout_ms: u64) -> Self {
        Self::LockTimeout {
            key: display_key(key),
            owner: owner.to_string(),
            timeout_ms,
        }
    }

    /// Create a WriteSkew error.
    pub fn write_skew(key: &Key, tx: &GlobalTxId) -> Self {
        Self::WriteSkew {
            key: display_key(key),
            tx: tx.to_string(),
        }
    }

    /// Create an OutdatedTopology error.
    pub fn outdated_topology(requested: TopologyId, current: TopologyId) -> Self {
        Self::OutdatedTopology { requested, current }
    }

    /// Create an InvalidUsage error.
    pub fn invalid_usage(message: impl Into<String>) -> Self {
        Self::InvalidUsage {
            message: message.into(),
        }
    }

    /// Create a Remote error.
    pub fn remote(node: &NodeId, message: impl Into<String>) -> Self {
        Self::Remote {
            node: node.to_string(),
            message: message.into(),
        }
    }

    /// Create a Storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error asks for the command to be resubmitted under a newer topology.
    pub fn is_topology_retry(&self) -> bool {
        matches!(self, Self::OutdatedTopology { .. })
    }

    /// Check if this is a lock acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Check if this is a write-skew conflict.
    pub fn is_write_skew(&self) -> bool {
        matches!(self, Self::WriteSkew { .. })
    }

    /// Check if the caller may retry the operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::OutdatedTopology { .. }
        )
    }
}

/// Result type using GridError.
pub type GridResult<T> = Result<T, GridError>;
