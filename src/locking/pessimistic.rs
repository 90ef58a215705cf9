//! Pessimistic transactions: eager locking.
//!
//! A write locks its keys before it runs. Keys owned by another node are
//! first locked on their primary owner through a lock-control request; only
//! after that succeeds does this node register its own (backup) lock.

use crate::control::rpc::RpcManager;
use crate::core::error::{GridError, GridResult};
use crate::core::ids::{display_key, Key, NodeId};
use crate::locking::command::{
    Command, CommandFlags, CommandResult, LockControlCommand, PrepareCommand,
};
use crate::locking::context::InvocationContext;
use crate::locking::interceptor::{CommandInvoker, LockingStrategy};
use crate::locking::policy::LockingPolicy;
use crate::locking::transaction::CacheTransaction;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Locks taken by one acquisition, kept for fail-fast release.
#[derive(Debug, Default)]
struct Acquired {
    local: Vec<Key>,
    remote: Vec<(NodeId, Vec<Key>)>,
}

pub struct PessimisticLockingStrategy {
    policy: Arc<LockingPolicy>,
    rpc: Arc<dyn RpcManager>,
}

impl PessimisticLockingStrategy {
    pub fn new(policy: Arc<LockingPolicy>, rpc: Arc<dyn RpcManager>) -> Self {
        Self { policy, rpc }
    }

    /// Lock `keys` for `tx`: remote primaries first, then this node.
    async fn acquire(
        &self,
        ctx: &mut InvocationContext,
        tx: &CacheTransaction,
        keys: &[Key],
        flags: CommandFlags,
    ) -> GridResult<Acquired> {
        let timeout = self.policy.effective_timeout(flags);
        let topology = self.policy.topology().clone();

        if let [key] = keys {
            if self.policy.should_lock_key(key) && !topology.is_state_transfer_in_progress() {
                if ctx.has_locked_key(key) {
                    return Ok(Acquired::default());
                }
                self.policy
                    .lock_or_register_backup_lock(ctx, tx, key, timeout)
                    .await?;
                tx.add_affected_keys(keys);
                return Ok(Acquired {
                    local: vec![key.clone()],
                    remote: Vec::new(),
                });
            }
        }

        // Keys already affected are locked on their primary owner.
        let mut by_owner: BTreeMap<NodeId, Vec<Key>> = BTreeMap::new();
        for key in keys.iter().filter(|key| !tx.contains_affected_key(key)) {
            match topology.primary_owner(topology.segment_for(key)) {
                Some(owner) if &owner != topology.local_node() => {
                    by_owner.entry(owner).or_default().push(key.clone())
                }
                _ => {}
            }
        }

        let mut acquired = Acquired::default();
        for (owner, group) in by_owner {
            tracing::debug!(
                tx = %tx.gtx(),
                owner = %owner,
                keys = group.len(),
                "locking on primary owner"
            );
            let request = LockControlCommand {
                flags,
                ..LockControlCommand::lock(tx.gtx().clone(), group.clone(), tx.topology_id())
            };
            if let Err(err) = self
                .rpc
                .invoke_remotely(&owner, Command::LockControl(request))
                .await
            {
                if !err.is_topology_retry() {
                    self.release_remote(tx, &acquired.remote).await;
                }
                return Err(err);
            }
            acquired.remote.push((owner, group));
        }
        tx.add_affected_keys(keys);

        let pending: Vec<Key> = keys
            .iter()
            .filter(|key| !ctx.has_locked_key(key))
            .cloned()
            .collect();
        match self
            .policy
            .lock_all_or_register_backup_lock(ctx, tx, &pending, timeout)
            .await
        {
            Ok(outcome) => {
                acquired.local = outcome.locked;
                Ok(acquired)
            }
            Err(err) => {
                if !err.is_topology_retry() {
                    self.release_remote(tx, &acquired.remote).await;
                }
                Err(err)
            }
        }
    }

    /// Give back remote locks taken by a failed operation.
    async fn release_remote(&self, tx: &CacheTransaction, groups: &[(NodeId, Vec<Key>)]) {
        for (owner, keys) in groups {
            tx.remove_affected_keys(keys);
            let request = LockControlCommand::unlock(tx.gtx().clone(), keys.clone(), tx.topology_id());
            if let Err(err) = self
                .rpc
                .invoke_remotely(owner, Command::LockControl(request))
                .await
            {
                tracing::warn!(
                    tx = %tx.gtx(),
                    owner = %owner,
                    error = %err,
                    "failed to release remote locks"
                );
            }
        }
    }

    async fn release(&self, ctx: &mut InvocationContext, tx: &CacheTransaction, acquired: &Acquired) {
        self.policy.release_locked_keys(ctx, &acquired.local);
        tx.remove_affected_keys(&acquired.local);
        self.release_remote(tx, &acquired.remote).await;
    }

    /// Acquire, run downstream, and release what was acquired if it fails.
    async fn lock_and_invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        let tx = ctx
            .transaction()
            .cloned()
            .ok_or_else(|| {
                GridError::invalid_usage(format!(
                    "{} outside a transaction on a transactional cache",
                    command.name()
                ))
            })?;
        let acquired = self.acquire(ctx, &tx, keys, command.flags()).await?;
        let result = next.invoke(ctx, command).await;
        if let Err(err) = &result {
            if !err.is_topology_retry() {
                self.release(ctx, &tx, &acquired).await;
            }
        }
        result
    }
}

fn expect_tx(ctx: &InvocationContext) -> GridResult<Arc<CacheTransaction>> {
    ctx.transaction()
        .cloned()
        .ok_or_else(|| GridError::invalid_usage("transaction command outside a transaction"))
}

#[async_trait]
impl LockingStrategy for PessimisticLockingStrategy {
    fn name(&self) -> &'static str {
        "pessimistic"
    }

    async fn visit_read(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        if ctx.is_in_tx() && command.has_flag(CommandFlags::FORCE_WRITE_LOCK) {
            return self.lock_and_invoke(ctx, command, keys, next).await;
        }
        next.invoke(ctx, command).await
    }

    async fn visit_write(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        self.lock_and_invoke(ctx, command, keys, next).await
    }

    async fn visit_invalidate(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        let to_lock: Vec<Key> = keys
            .iter()
            .filter(|key| self.policy.should_lock_key(key) && !ctx.has_locked_key(key))
            .cloned()
            .collect();
        let timeout = self.policy.effective_timeout(command.flags());
        if let Err(err) = self.policy.lock_all_keys(ctx, &to_lock, timeout).await {
            // Swallowed: the invalidation is dropped, not failed.
            tracing::warn!(
                keys = to_lock.len(),
                first_key = %to_lock.first().map(display_key).unwrap_or_default(),
                error = %err,
                "could not lock keys for invalidation, skipping"
            );
            self.policy.release_locked_keys(ctx, &to_lock);
            return Ok(CommandResult::Empty);
        }
        let result = next.invoke(ctx, command).await;
        self.policy.release_locked_keys(ctx, &to_lock);
        result
    }

    async fn visit_prepare(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        prepare: &PrepareCommand,
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        let tx = expect_tx(ctx)?;
        if !ctx.is_origin_local() {
            // Normally locked already by lock-control; covers keys that were not.
            tx.add_affected_keys(&prepare.keys);
            let pending: Vec<Key> = prepare
                .keys
                .iter()
                .filter(|key| !ctx.has_locked_key(key))
                .cloned()
                .collect();
            let timeout = self.policy.effective_timeout(prepare.flags);
            if let Err(err) = self
                .policy
                .lock_all_or_register_backup_lock(ctx, &tx, &pending, timeout)
                .await
            {
                if !err.is_topology_retry() {
                    self.policy.release_on_completion(ctx);
                }
                return Err(err);
            }
        }

        let result = next.invoke(ctx, command).await;
        match &result {
            Ok(_) if prepare.one_phase => self.policy.release_on_completion(ctx),
            Err(err) if !err.is_topology_retry() => self.policy.release_on_completion(ctx),
            _ => {}
        }
        result
    }

    async fn visit_lock_control(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        lock_control: &LockControlCommand,
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        let tx = expect_tx(ctx)?;

        if lock_control.unlock {
            if ctx.is_origin_local() {
                return Err(GridError::invalid_usage(
                    "unlock requests are only accepted from remote nodes",
                ));
            }
            self.policy.release_locked_keys(ctx, &lock_control.keys);
            tx.remove_affected_keys(&lock_control.keys);
            return Ok(CommandResult::Flag(true));
        }

        if ctx.is_origin_local() {
            if lock_control
                .keys
                .iter()
                .all(|key| tx.contains_affected_key(key))
            {
                return Ok(CommandResult::Flag(true));
            }
            return self
                .lock_and_invoke(ctx, command, &lock_control.keys, next)
                .await;
        }

        // Remote lock request: this node is the primary owner.
        if lock_control.keys.iter().all(|key| ctx.has_locked_key(key)) {
            return Ok(CommandResult::Flag(true));
        }
        let newly_affected: Vec<Key> = lock_control
            .keys
            .iter()
            .filter(|key| !tx.contains_affected_key(key))
            .cloned()
            .collect();
        let newly_locked: Vec<Key> = lock_control
            .keys
            .iter()
            .filter(|key| !ctx.has_locked_key(key))
            .cloned()
            .collect();
        tx.add_affected_keys(&lock_control.keys);
        let timeout = self.policy.effective_timeout(lock_control.flags);
        let outcome = self
            .policy
            .lock_all_or_register_backup_lock(ctx, &tx, &lock_control.keys, timeout)
            .await;
        if let Err(err) = outcome {
            tx.remove_affected_keys(&newly_affected);
            return Err(err);
        }
        let result = next.invoke(ctx, command).await;
        if let Err(err) = &result {
            if !err.is_topology_retry() {
                self.policy.release_locked_keys(ctx, &newly_locked);
                tx.remove_affected_keys(&newly_affected);
            }
        }
        result
    }
}
