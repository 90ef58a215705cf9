//! Locking interceptor.
//!
//! Entry point for every command. Handles what is common to all cache
//! modes (lock skipping, clear, best-effort L1 invalidation, lock release on
//! commit and rollback) and delegates the rest to the configured
//! [`LockingStrategy`].

use crate::core::error::{GridError, GridResult};
use crate::core::ids::Key;
use crate::locking::command::{
    Command, CommandFlags, CommandResult, InvalidateCommand, LockControlCommand, PrepareCommand,
};
use crate::locking::context::InvocationContext;
use crate::locking::policy::LockingPolicy;
use async_trait::async_trait;
use std::sync::Arc;

/// A stage that executes commands.
#[async_trait]
pub trait CommandInvoker: Send + Sync {
    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> GridResult<CommandResult>;
}

/// Mode-specific locking behaviour.
///
/// Each visit receives the keys the command touches and the downstream
/// stage; the strategy locks, invokes `next`, and releases as its mode
/// requires.
#[async_trait]
pub trait LockingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn visit_read(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult>;

    async fn visit_write(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult>;

    async fn visit_invalidate(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult>;

    async fn visit_prepare(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        prepare: &PrepareCommand,
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult>;

    async fn visit_lock_control(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        lock_control: &LockControlCommand,
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult>;
}

pub struct LockingInterceptor {
    policy: Arc<LockingPolicy>,
    strategy: Arc<dyn LockingStrategy>,
    next: Arc<dyn CommandInvoker>,
}

impl LockingInterceptor {
    pub fn new(
        policy: Arc<LockingPolicy>,
        strategy: Arc<dyn LockingStrategy>,
        next: Arc<dyn CommandInvoker>,
    ) -> Self {
        Self {
            policy,
            strategy,
            next,
        }
    }

    pub fn policy(&self) -> &Arc<LockingPolicy> {
        &self.policy
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    async fn visit_clear(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> GridResult<CommandResult> {
        let timeout = self.policy.effective_timeout(command.flags());
        let locked = self.policy.lock_for_clear(ctx, timeout).await?;
        let result = self.next.invoke(ctx, command).await;
        self.policy.release_locked_keys(ctx, &locked);
        result
    }

    /// Best-effort invalidation of near-cache copies: keys locked elsewhere
    /// are left alone instead of failing the batch.
    async fn visit_invalidate_l1(
        &self,
        ctx: &mut InvocationContext,
        invalidate: &InvalidateCommand,
    ) -> GridResult<CommandResult> {
        let locked = self.policy.try_lock_each(ctx, &invalidate.keys).await;
        let admitted: Vec<Key> = invalidate
            .keys
            .iter()
            .filter(|key| ctx.has_locked_key(key))
            .cloned()
            .collect();
        if admitted.is_empty() {
            return Ok(CommandResult::Empty);
        }
        let filtered = Command::InvalidateL1(invalidate.with_keys(admitted));
        let result = self.next.invoke(ctx, &filtered).await;
        self.policy.release_locked_keys(ctx, &locked);
        result
    }

    async fn visit_commit(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> GridResult<CommandResult> {
        let result = self.next.invoke(ctx, command).await;
        match &result {
            // The resubmitted commit reuses the locks.
            Err(err) if err.is_topology_retry() => {}
            _ => self.policy.release_all(ctx),
        }
        result
    }

    async fn visit_rollback(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> GridResult<CommandResult> {
        let result = self.next.invoke(ctx, command).await;
        self.policy.release_on_completion(ctx);
        result
    }
}

fn require_tx(ctx: &InvocationContext, command: &Command) -> GridResult<()> {
    if ctx.is_in_tx() {
        Ok(())
    } else {
        Err(GridError::invalid_usage(format!(
            "{} requires a transactional context",
            command.name()
        )))
    }
}

fn skips_locking(command: &Command) -> bool {
    command.has_flag(CommandFlags::SKIP_LOCKING)
        && !matches!(
            command,
            Command::Prepare(_) | Command::Commit(_) | Command::Rollback(_) | Command::LockControl(_)
        )
}

#[async_trait]
impl CommandInvoker for LockingInterceptor {
    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> GridResult<CommandResult> {
        if skips_locking(command) {
            return self.next.invoke(ctx, command).await;
        }
        let next = self.next.as_ref();
        match command {
            Command::Get(read) => {
                self.strategy
                    .visit_read(ctx, command, std::slice::from_ref(&read.key), next)
                    .await
            }
            Command::GetAll(read) => {
                self.strategy
                    .visit_read(ctx, command, &read.keys, next)
                    .await
            }
            Command::Write(write) => {
                self.strategy
                    .visit_write(ctx, command, std::slice::from_ref(&write.key), next)
                    .await
            }
            Command::PutMap(put_map) => {
                self.strategy
                    .visit_write(ctx, command, &put_map.keys(), next)
                    .await
            }
            Command::Clear(_) => self.visit_clear(ctx, command).await,
            Command::Invalidate(invalidate) => {
                self.strategy
                    .visit_invalidate(ctx, command, &invalidate.keys, next)
                    .await
            }
            Command::InvalidateL1(invalidate) => self.visit_invalidate_l1(ctx, invalidate).await,
            Command::Prepare(prepare) => {
                require_tx(ctx, command)?;
                self.strategy
                    .visit_prepare(ctx, command, prepare, next)
                    .await
            }
            Command::Commit(_) => {
                require_tx(ctx, command)?;
                self.visit_commit(ctx, command).await
            }
            Command::Rollback(_) => {
                require_tx(ctx, command)?;
                self.visit_rollback(ctx, command).await
            }
            Command::LockControl(lock_control) => {
                require_tx(ctx, command)?;
                self.strategy
                    .visit_lock_control(ctx, command, lock_control, next)
                    .await
            }
        }
    }
}
