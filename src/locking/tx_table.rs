//! Live transactions on this node.

use crate::core::ids::{GlobalTxId, TopologyId};
use crate::locking::transaction::CacheTransaction;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of local and remote transactions that have not completed yet.
#[derive(Default)]
pub struct TransactionTable {
    transactions: RwLock<HashMap<GlobalTxId, Arc<CacheTransaction>>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction started on this node.
    pub fn begin_local(&self, gtx: GlobalTxId, topology_id: TopologyId) -> Arc<CacheTransaction> {
        let tx = Arc::new(CacheTransaction::new_local(gtx.clone(), topology_id));
        self.transactions.write().insert(gtx, tx.clone());
        tx
    }

    /// Look up a remote transaction, creating it on its first command here.
    pub fn get_or_create_remote(
        &self,
        gtx: &GlobalTxId,
        topology_id: TopologyId,
    ) -> Arc<CacheTransaction> {
        if let Some(tx) = self.transactions.read().get(gtx) {
            return tx.clone();
        }
        self.transactions
            .write()
            .entry(gtx.clone())
            .or_insert_with(|| Arc::new(CacheTransaction::new_remote(gtx.clone(), topology_id)))
            .clone()
    }

    pub fn get(&self, gtx: &GlobalTxId) -> Option<Arc<CacheTransaction>> {
        self.transactions.read().get(gtx).cloned()
    }

    /// Remove a finished transaction and wake barrier waiters.
    pub fn complete(&self, gtx: &GlobalTxId) -> Option<Arc<CacheTransaction>> {
        let removed = self.transactions.write().remove(gtx);
        if let Some(ref tx) = removed {
            tx.mark_finished();
            tracing::debug!(tx = %gtx, state = ?tx.state(), "transaction completed");
        }
        removed
    }

    /// Transactions that started under a topology older than `topology_id`.
    pub fn older_than(&self, topology_id: TopologyId) -> Vec<Arc<CacheTransaction>> {
        self.transactions
            .read()
            .values()
            .filter(|tx| tx.topology_id() < topology_id)
            .cloned()
            .collect()
    }

    /// Lowest topology id among live transactions.
    pub fn min_topology_id(&self) -> Option<TopologyId> {
        self.transactions
            .read()
            .values()
            .map(|tx| tx.topology_id())
            .min()
    }

    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::NodeId;

    #[test]
    fn test_remote_transaction_is_shared() {
        let table = TransactionTable::new();
        let gtx = GlobalTxId::new(NodeId::new("b"), 9);
        let first = table.get_or_create_remote(&gtx, 3);
        let second = table.get_or_create_remote(&gtx, 4);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_origin_local());
        assert_eq!(second.topology_id(), 3);
    }

    #[test]
    fn test_complete_marks_finished() {
        let table = TransactionTable::new();
        let gtx = GlobalTxId::new(NodeId::new("a"), 1);
        let tx = table.begin_local(gtx.clone(), 1);
        assert_eq!(table.len(), 1);

        table.complete(&gtx);
        assert!(tx.is_finished());
        assert!(table.is_empty());
    }

    #[test]
    fn test_older_than() {
        let table = TransactionTable::new();
        table.begin_local(GlobalTxId::new(NodeId::new("a"), 1), 1);
        table.begin_local(GlobalTxId::new(NodeId::new("a"), 2), 5);
        assert_eq!(table.older_than(5).len(), 1);
        assert_eq!(table.min_topology_id(), Some(1));
    }
}
