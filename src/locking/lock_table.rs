//! Per-key exclusive lock table.
//!
//! `LockManager` is the contract the locking strategies consume. `KeyLockTable`
//! is the in-memory implementation: exclusive, re-entrant for the same owner,
//! with waiters parked on a `Notify` until a release or their deadline.

use crate::core::error::{GridError, GridResult};
use crate::core::ids::{Key, LockOwner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Lock table contract.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire `key` for `owner`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` when another owner still holds the key at the deadline.
    async fn lock(&self, key: &Key, owner: &LockOwner, timeout: Duration) -> GridResult<()>;

    /// Acquire every key or none: a timeout on any key releases the keys
    /// acquired by this call and fails the batch.
    async fn lock_all(&self, keys: &[Key], owner: &LockOwner, timeout: Duration)
        -> GridResult<()>;

    /// Release `keys` if held by `owner`.
    fn unlock(&self, keys: &[Key], owner: &LockOwner);

    /// Release every key held by `owner`.
    fn unlock_all(&self, owner: &LockOwner);

    /// Current holder of `key`.
    fn owner_of(&self, key: &Key) -> Option<LockOwner>;

    fn is_locked(&self, key: &Key) -> bool {
        self.owner_of(key).is_some()
    }
}

#[derive(Default)]
struct LockState {
    holders: HashMap<Key, LockOwner>,
    by_owner: HashMap<LockOwner, HashSet<Key>>,
}

impl LockState {
    fn try_acquire(&mut self, key: &Key, owner: &LockOwner) -> bool {
        match self.holders.get(key) {
            Some(holder) => holder == owner,
            None => {
                self.holders.insert(key.clone(), owner.clone());
                self.by_owner
                    .entry(owner.clone())
                    .or_default()
                    .insert(key.clone());
                true
            }
        }
    }

    fn release(&mut self, key: &Key, owner: &LockOwner) -> bool {
        if self.holders.get(key) != Some(owner) {
            return false;
        }
        self.holders.remove(key);
        if let Some(keys) = self.by_owner.get_mut(owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(owner);
            }
        }
        true
    }
}

/// In-memory lock table.
#[derive(Default)]
pub struct KeyLockTable {
    state: Mutex<LockState>,
    released: Notify,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held by `owner`.
    pub fn locked_keys(&self, owner: &LockOwner) -> Vec<Key> {
        self.state
            .lock()
            .by_owner
            .get(owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of locked keys.
    pub fn len(&self) -> usize {
        self.state.lock().holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().holders.is_empty()
    }

    fn try_acquire(&self, key: &Key, owner: &LockOwner) -> bool {
        self.state.lock().try_acquire(key, owner)
    }
}

#[async_trait]
impl LockManager for KeyLockTable {
    async fn lock(&self, key: &Key, owner: &LockOwner, timeout: Duration) -> GridResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a release in between is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(key, owner) {
                return Ok(());
            }
            if Instant::now() >= deadline
                || tokio::time::timeout_at(deadline, notified).await.is_err()
            {
                if self.try_acquire(key, owner) {
                    return Ok(());
                }
                tracing::debug!(
                    key = %crate::core::ids::display_key(key),
                    owner = %owner,
                    timeout_ms = timeout.as_millis() as u64,
                    "lock acquisition timed out"
                );
                return Err(GridError::lock_timeout(key, owner, timeout.as_millis() as u64));
            }
        }
    }

    async fn lock_all(
        &self,
        keys: &[Key],
        owner: &LockOwner,
        timeout: Duration,
    ) -> GridResult<()> {
        let mut ordered: Vec<&Key> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + timeout;
        let mut acquired = Vec::with_capacity(ordered.len());
        for key in ordered {
            let already_held = self.owner_of(key).as_ref() == Some(owner);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(err) = self.lock(key, owner, remaining).await {
                self.unlock(&acquired, owner);
                return Err(err);
            }
            if !already_held {
                acquired.push(key.clone());
            }
        }
        Ok(())
    }

    fn unlock(&self, keys: &[Key], owner: &LockOwner) {
        let released = {
            let mut state = self.state.lock();
            keys.iter()
                .filter(|key| state.release(key, owner))
                .count()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
    }

    fn unlock_all(&self, owner: &LockOwner) {
        let released = {
            let mut state = self.state.lock();
            let keys = state.by_owner.remove(owner).unwrap_or_default();
            for key in &keys {
                state.holders.remove(key);
            }
            keys.len()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
    }

    fn owner_of(&self, key: &Key) -> Option<LockOwner> {
        self.state.lock().holders.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{CommandId, NodeId};
    use std::sync::Arc;

    fn owner(id: u64) -> LockOwner {
        LockOwner::Command(CommandId {
            origin: NodeId::new("a"),
            id,
        })
    }

    fn key(k: &'static str) -> Key {
        Key::from_static(k.as_bytes())
    }

    #[tokio::test]
    async fn test_lock_is_reentrant_for_owner() {
        let table = KeyLockTable::new();
        table.lock(&key("k"), &owner(1), Duration::ZERO).await.unwrap();
        table.lock(&key("k"), &owner(1), Duration::ZERO).await.unwrap();
        assert_eq!(table.owner_of(&key("k")), Some(owner(1)));
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_fast() {
        let table = KeyLockTable::new();
        table.lock(&key("k"), &owner(1), Duration::ZERO).await.unwrap();
        let err = table
            .lock(&key("k"), &owner(2), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let table = Arc::new(KeyLockTable::new());
        table.lock(&key("k"), &owner(1), Duration::ZERO).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .lock(&key("k"), &owner(2), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        table.unlock_all(&owner(1));

        waiter.await.unwrap().unwrap();
        assert_eq!(table.owner_of(&key("k")), Some(owner(2)));
    }

    #[tokio::test]
    async fn test_lock_all_rolls_back_on_timeout() {
        let table = KeyLockTable::new();
        table.lock(&key("b"), &owner(2), Duration::ZERO).await.unwrap();

        let err = table
            .lock_all(&[key("a"), key("b"), key("c")], &owner(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(!table.is_locked(&key("a")));
        assert!(!table.is_locked(&key("c")));
        assert_eq!(table.owner_of(&key("b")), Some(owner(2)));
    }

    #[tokio::test]
    async fn test_lock_all_keeps_previously_held_keys_on_failure() {
        let table = KeyLockTable::new();
        table.lock(&key("a"), &owner(1), Duration::ZERO).await.unwrap();
        table.lock(&key("b"), &owner(2), Duration::ZERO).await.unwrap();

        assert!(table
            .lock_all(&[key("a"), key("b")], &owner(1), Duration::ZERO)
            .await
            .is_err());
        assert_eq!(table.owner_of(&key("a")), Some(owner(1)));
    }

    #[tokio::test]
    async fn test_unlock_ignores_foreign_keys() {
        let table = KeyLockTable::new();
        table.lock(&key("k"), &owner(1), Duration::ZERO).await.unwrap();
        table.unlock(&[key("k")], &owner(2));
        assert!(table.is_locked(&key("k")));
        table.unlock_all(&owner(1));
        assert!(table.is_empty());
    }
}
