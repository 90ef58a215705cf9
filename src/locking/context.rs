//! Per-invocation state.

use crate::core::ids::{CommandId, GlobalTxId, Key, LockOwner};
use crate::locking::transaction::CacheTransaction;
use std::collections::HashSet;
use std::sync::Arc;

/// State carried by one command invocation.
///
/// Transactional contexts record locked keys on the shared `CacheTransaction`
/// so they survive across the transaction's operations; non-transactional
/// contexts keep them locally and release them when the command ends.
#[derive(Debug)]
pub struct InvocationContext {
    owner: LockOwner,
    origin_local: bool,
    locked_keys: HashSet<Key>,
    transaction: Option<Arc<CacheTransaction>>,
}

impl InvocationContext {
    /// Context for a single non-transactional command.
    pub fn non_tx(command: CommandId, origin_local: bool) -> Self {
        Self {
            owner: LockOwner::Command(command),
            origin_local,
            locked_keys: HashSet::new(),
            transaction: None,
        }
    }

    /// Context bound to a transaction.
    pub fn tx(transaction: Arc<CacheTransaction>) -> Self {
        Self {
            owner: transaction.lock_owner(),
            origin_local: transaction.is_origin_local(),
            locked_keys: HashSet::new(),
            transaction: Some(transaction),
        }
    }

    pub fn lock_owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin_local
    }

    pub fn is_in_tx(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction(&self) -> Option<&Arc<CacheTransaction>> {
        self.transaction.as_ref()
    }

    pub fn global_tx(&self) -> Option<&GlobalTxId> {
        self.transaction.as_ref().map(|tx| tx.gtx())
    }

    /// Record a key this invocation holds a real lock for.
    pub fn add_locked_key(&mut self, key: Key) {
        match self.transaction {
            Some(ref tx) => tx.add_locked_key(key),
            None => {
                self.locked_keys.insert(key);
            }
        }
    }

    pub fn has_locked_key(&self, key: &Key) -> bool {
        match self.transaction {
            Some(ref tx) => tx.owns_lock(key),
            None => self.locked_keys.contains(key),
        }
    }

    pub fn locked_keys(&self) -> Vec<Key> {
        match self.transaction {
            Some(ref tx) => tx.locked_keys(),
            None => self.locked_keys.iter().cloned().collect(),
        }
    }

    /// Forget every recorded lock and return the keys.
    pub fn clear_locked_keys(&mut self) -> Vec<Key> {
        match self.transaction {
            Some(ref tx) => tx.clear_locked_keys(),
            None => self.locked_keys.drain().collect(),
        }
    }

    /// Forget `keys` only.
    pub fn remove_locked_keys(&mut self, keys: &[Key]) {
        match self.transaction {
            Some(ref tx) => tx.remove_locked_keys(keys),
            None => {
                for key in keys {
                    self.locked_keys.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::NodeId;

    #[test]
    fn test_non_tx_context_tracks_keys_locally() {
        let mut ctx = InvocationContext::non_tx(
            CommandId {
                origin: NodeId::new("a"),
                id: 1,
            },
            true,
        );
        ctx.add_locked_key(Key::from_static(b"k"));
        assert!(ctx.has_locked_key(&Key::from_static(b"k")));
        assert_eq!(ctx.clear_locked_keys().len(), 1);
        assert!(ctx.locked_keys().is_empty());
    }

    #[test]
    fn test_tx_context_delegates_to_transaction() {
        let tx = Arc::new(CacheTransaction::new_remote(
            GlobalTxId::new(NodeId::new("b"), 4),
            1,
        ));
        let mut ctx = InvocationContext::tx(tx.clone());
        assert!(!ctx.is_origin_local());
        ctx.add_locked_key(Key::from_static(b"k"));
        assert!(tx.owns_lock(&Key::from_static(b"k")));
        assert_eq!(ctx.global_tx(), Some(tx.gtx()));
    }
}
