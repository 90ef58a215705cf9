//! Optimistic transactions: no locks until prepare.
//!
//! Reads record the version they observed. Prepare locks (or backup-locks)
//! every written key in one batch and rejects the transaction if a locked
//! key changed since it was read.

use crate::commit::write_skew;
use crate::core::error::{GridError, GridResult};
use crate::core::ids::Key;
use crate::locking::command::{Command, CommandResult, LockControlCommand, PrepareCommand};
use crate::locking::context::InvocationContext;
use crate::locking::interceptor::{CommandInvoker, LockingStrategy};
use crate::locking::policy::LockingPolicy;
use crate::locking::transaction::CacheTransaction;
use async_trait::async_trait;
use std::sync::Arc;

pub struct OptimisticLockingStrategy {
    policy: Arc<LockingPolicy>,
    /// Repeatable read with write-skew checks and reliable return values.
    track_reads: bool,
}

impl OptimisticLockingStrategy {
    pub fn new(policy: Arc<LockingPolicy>, track_reads: bool) -> Self {
        Self {
            policy,
            track_reads,
        }
    }

    fn mark_read(&self, tx: &CacheTransaction, keys: &[Key]) {
        if !self.track_reads {
            return;
        }
        for key in keys {
            // Own writes and repeated reads keep the first observation.
            if tx.is_read(key) || tx.lookup_modification(key).is_some() {
                continue;
            }
            let observed = self
                .policy
                .container()
                .peek(key)
                .and_then(|entry| entry.version());
            tx.add_read_key(key.clone(), observed);
        }
    }

    fn check_locked_keys(&self, tx: &CacheTransaction, locked: &[Key]) -> GridResult<()> {
        if !self.track_reads {
            return Ok(());
        }
        for key in locked {
            write_skew::check_key(tx, key, self.policy.container().as_ref())?;
        }
        Ok(())
    }
}

fn expect_tx<'a>(ctx: &'a InvocationContext, command: &Command) -> GridResult<&'a Arc<CacheTransaction>> {
    ctx.transaction().ok_or_else(|| {
        GridError::invalid_usage(format!(
            "{} outside a transaction on a transactional cache",
            command.name()
        ))
    })
}

#[async_trait]
impl LockingStrategy for OptimisticLockingStrategy {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    async fn visit_read(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        if let Some(tx) = ctx.transaction() {
            self.mark_read(tx, keys);
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
        let tx = expect_tx(ctx, command)?;
        if matches!(command, Command::Write(write) if write.reads_previous_value()) {
            self.mark_read(tx, keys);
        }
        tx.add_affected_keys(keys);
        next.invoke(ctx, command).await
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
        self.policy.lock_all_keys(ctx, &to_lock, timeout).await?;
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
        let tx = expect_tx(ctx, command)?.clone();
        tx.add_affected_keys(&prepare.keys);
        if !ctx.is_origin_local() {
            for (key, version) in &prepare.read_versions {
                tx.add_read_key(key.clone(), *version);
            }
        }

        let mut keys = prepare.keys.clone();
        if prepare.retried && ctx.is_origin_local() {
            tx.clear_backup_locks();
            keys.retain(|key| !tx.owns_lock(key));
        }

        let timeout = self.policy.effective_timeout(prepare.flags);
        let acquired = match self
            .policy
            .lock_all_or_register_backup_lock(ctx, &tx, &keys, timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                if !err.is_topology_retry() {
                    self.policy.release_on_completion(ctx);
                }
                return Err(err);
            }
        };
        if let Err(err) = self.check_locked_keys(&tx, &acquired.locked) {
            self.policy.release_on_completion(ctx);
            return Err(err);
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
        _ctx: &mut InvocationContext,
        _command: &Command,
        _lock_control: &LockControlCommand,
        _next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        Err(GridError::invalid_usage(
            "explicit locking is not available to optimistic transactions",
        ))
    }
}
