//! Remote invocation and partition-handling contracts.
//!
//! The transport itself lives outside this crate. The locking layer only
//! needs to send a command to one node and wait for its result, and to ask
//! whether a transaction's outcome is still ambiguous after a partition.

use crate::core::error::{GridError, GridResult};
use crate::core::ids::{GlobalTxId, NodeId};
use crate::locking::command::{Command, CommandResult};
use async_trait::async_trait;

/// Sends commands to other members.
#[async_trait]
pub trait RpcManager: Send + Sync {
    /// Invoke `command` on `target` as a remote-origin command and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns the remote failure unchanged (lock timeouts and topology
    /// retries keep their kind) or `Remote` for transport failures.
    async fn invoke_remotely(&self, target: &NodeId, command: Command)
        -> GridResult<CommandResult>;
}

/// RPC manager for a cache that never talks to other nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnlyRpc;

#[async_trait]
impl RpcManager for LocalOnlyRpc {
    async fn invoke_remotely(
        &self,
        target: &NodeId,
        command: Command,
    ) -> GridResult<CommandResult> {
        Err(GridError::remote(
            target,
            format!("{} cannot be sent from a local-only cache", command.name()),
        ))
    }
}

/// Partition-handling collaborator.
pub trait PartitionHandler: Send + Sync {
    /// Whether `gtx` committed on some owners but its outcome is unknown on others.
    fn is_transaction_partially_committed(&self, gtx: &GlobalTxId) -> bool;
}

/// Partition handling disabled: no transaction is ever ambiguous.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPartitionHandling;

impl PartitionHandler for NoPartitionHandling {
    fn is_transaction_partially_committed(&self, _gtx: &GlobalTxId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::command::RollbackCommand;

    #[tokio::test]
    async fn test_local_only_rpc_rejects_remote_calls() {
        let gtx = GlobalTxId::new(NodeId::new("a"), 1);
        let err = LocalOnlyRpc
            .invoke_remotely(&NodeId::new("b"), Command::Rollback(RollbackCommand { gtx }))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Remote { .. }));
    }

    #[test]
    fn test_no_partition_handling() {
        let gtx = GlobalTxId::new(NodeId::new("a"), 1);
        assert!(!NoPartitionHandling.is_transaction_partially_committed(&gtx));
    }
}
