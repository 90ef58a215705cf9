//! Lock operations shared by every locking strategy.
//!
//! The strategies decide *when* to lock; `LockingPolicy` decides *how*: which
//! keys this node may lock for real, which only get a backup lock, how long
//! to wait, and when a transaction's locks may be released.

use crate::commit::container::DataContainer;
use crate::control::rpc::PartitionHandler;
use crate::control::topology::{Ownership, TopologyOracle};
use crate::core::error::GridResult;
use crate::core::ids::{display_key, Key};
use crate::locking::barrier::PendingLockManager;
use crate::locking::command::CommandFlags;
use crate::locking::context::InvocationContext;
use crate::locking::lock_table::LockManager;
use crate::locking::transaction::CacheTransaction;
use std::sync::Arc;
use std::time::Duration;

/// What [`LockingPolicy::lock_or_register_backup_lock`] did for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Real lock taken on this node (primary owner).
    Locked,
    /// Backup lock registered; the real lock lives on the primary.
    BackupLocked,
    /// This node does not own the key.
    NotOwner,
}

/// Result of a batched acquisition.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchLockOutcome {
    pub locked: Vec<Key>,
    pub backup_locked: Vec<Key>,
}

pub struct LockingPolicy {
    locks: Arc<dyn LockManager>,
    topology: Arc<dyn TopologyOracle>,
    barrier: PendingLockManager,
    partitions: Arc<dyn PartitionHandler>,
    container: Arc<dyn DataContainer>,
    acquire_timeout: Duration,
}

impl LockingPolicy {
    pub fn new(
        locks: Arc<dyn LockManager>,
        topology: Arc<dyn TopologyOracle>,
        barrier: PendingLockManager,
        partitions: Arc<dyn PartitionHandler>,
        container: Arc<dyn DataContainer>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            locks,
            topology,
            barrier,
            partitions,
            container,
            acquire_timeout,
        }
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn topology(&self) -> &Arc<dyn TopologyOracle> {
        &self.topology
    }

    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    /// Only the primary owner takes real locks.
    pub fn should_lock_key(&self, key: &Key) -> bool {
        self.topology
            .is_primary_owner(self.topology.segment_for(key))
    }

    fn ownership(&self, key: &Key) -> Ownership {
        self.topology.ownership(self.topology.segment_for(key))
    }

    pub fn effective_timeout(&self, flags: CommandFlags) -> Duration {
        if flags.contains(CommandFlags::ZERO_LOCK_ACQUISITION_TIMEOUT) {
            Duration::ZERO
        } else {
            self.acquire_timeout
        }
    }

    /// Take a real lock on `key` for the context's owner and record it.
    pub async fn lock_key(
        &self,
        ctx: &mut InvocationContext,
        key: &Key,
        timeout: Duration,
    ) -> GridResult<()> {
        self.locks.lock(key, ctx.lock_owner(), timeout).await?;
        ctx.add_locked_key(key.clone());
        Ok(())
    }

    /// Lock every key or none, then record them.
    pub async fn lock_all_keys(
        &self,
        ctx: &mut InvocationContext,
        keys: &[Key],
        timeout: Duration,
    ) -> GridResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.locks.lock_all(keys, ctx.lock_owner(), timeout).await?;
        for key in keys {
            ctx.add_locked_key(key.clone());
        }
        Ok(())
    }

    /// Release everything the context's owner holds and forget backup locks.
    pub fn release_all(&self, ctx: &mut InvocationContext) {
        self.locks.unlock_all(ctx.lock_owner());
        ctx.clear_locked_keys();
        if let Some(tx) = ctx.transaction() {
            tx.clear_backup_locks();
        }
    }

    /// Release `keys` only.
    pub fn release_locked_keys(&self, ctx: &mut InvocationContext, keys: &[Key]) {
        if keys.is_empty() {
            return;
        }
        self.locks.unlock(keys, ctx.lock_owner());
        ctx.remove_locked_keys(keys);
    }

    /// Lock `key` if this node is its primary owner, register a backup lock if
    /// it is a backup owner, and do nothing otherwise.
    ///
    /// A real lock first waits for older-topology transactions writing the
    /// key, and the lock itself gets what is left of `timeout`.
    pub async fn lock_or_register_backup_lock(
        &self,
        ctx: &mut InvocationContext,
        tx: &CacheTransaction,
        key: &Key,
        timeout: Duration,
    ) -> GridResult<LockOutcome> {
        match self.ownership(key) {
            Ownership::Primary => {
                let remaining = self
                    .barrier
                    .await_pending_transactions_for_key(tx, key, timeout)
                    .await?;
                self.lock_key(ctx, key, remaining).await?;
                Ok(LockOutcome::Locked)
            }
            Ownership::Backup => {
                tx.add_backup_lock(key.clone());
                Ok(LockOutcome::BackupLocked)
            }
            Ownership::NonOwner => Ok(LockOutcome::NotOwner),
        }
    }

    /// Batched [`Self::lock_or_register_backup_lock`]: primary-owned keys are
    /// locked in one all-or-nothing request.
    pub async fn lock_all_or_register_backup_lock(
        &self,
        ctx: &mut InvocationContext,
        tx: &CacheTransaction,
        keys: &[Key],
        timeout: Duration,
    ) -> GridResult<BatchLockOutcome> {
        let mut outcome = BatchLockOutcome::default();
        for key in keys {
            match self.ownership(key) {
                Ownership::Primary => outcome.locked.push(key.clone()),
                Ownership::Backup => outcome.backup_locked.push(key.clone()),
                Ownership::NonOwner => {}
            }
        }

        if !outcome.locked.is_empty() {
            let remaining = self
                .barrier
                .await_pending_transactions_for_all_keys(tx, &outcome.locked, timeout)
                .await?;
            self.lock_all_keys(ctx, &outcome.locked, remaining).await?;
        }
        for key in &outcome.backup_locked {
            tx.add_backup_lock(key.clone());
        }
        Ok(outcome)
    }

    /// Release the transaction's locks when it completes, unless it started
    /// elsewhere or its outcome is still ambiguous after a partition.
    pub fn release_lock_on_tx_completion(&self, ctx: &mut InvocationContext) {
        let Some(tx) = ctx.transaction().cloned() else {
            self.release_all(ctx);
            return;
        };
        if !tx.is_origin_local() {
            return;
        }
        if self.partitions.is_transaction_partially_committed(tx.gtx()) {
            tracing::warn!(
                tx = %tx.gtx(),
                "outcome ambiguous after partition, keeping locks"
            );
            return;
        }
        self.release_all(ctx);
    }

    /// Release after a one-phase prepare, a failed prepare, or a rollback.
    ///
    /// Remote transactions release unconditionally; local ones go through
    /// the partition check.
    pub fn release_on_completion(&self, ctx: &mut InvocationContext) {
        if ctx.is_origin_local() {
            self.release_lock_on_tx_completion(ctx);
        } else {
            self.release_all(ctx);
        }
    }

    /// Lock every resident key this node is primary for, ahead of a clear.
    /// Returns the keys locked by this call.
    pub async fn lock_for_clear(
        &self,
        ctx: &mut InvocationContext,
        timeout: Duration,
    ) -> GridResult<Vec<Key>> {
        let keys: Vec<Key> = self
            .container
            .keys()
            .into_iter()
            .filter(|key| self.should_lock_key(key) && !ctx.has_locked_key(key))
            .collect();
        tracing::debug!(keys = keys.len(), "locking resident keys for clear");
        self.lock_all_keys(ctx, &keys, timeout).await?;
        Ok(keys)
    }

    /// Try each key with no wait; keys that cannot be locked are skipped.
    /// Returns the keys locked by this call.
    pub async fn try_lock_each(&self, ctx: &mut InvocationContext, keys: &[Key]) -> Vec<Key> {
        let mut locked = Vec::with_capacity(keys.len());
        for key in keys {
            if ctx.has_locked_key(key) {
                continue;
            }
            match self.lock_key(ctx, key, Duration::ZERO).await {
                Ok(()) => locked.push(key.clone()),
                Err(err) => tracing::warn!(
                    key = %display_key(key),
                    error = %err,
                    "key locked elsewhere, skipped"
                ),
            }
        }
        locked
    }
}
