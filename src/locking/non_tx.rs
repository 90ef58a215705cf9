//! Locking for non-transactional caches.
//!
//! Locks live for one command. Every exit path releases them, including a
//! cancelled future, because the release is tied to a drop guard.

use crate::core::error::{GridError, GridResult};
use crate::core::ids::{Key, LockOwner};
use crate::locking::command::{Command, CommandResult, LockControlCommand, PrepareCommand};
use crate::locking::context::InvocationContext;
use crate::locking::interceptor::{CommandInvoker, LockingStrategy};
use crate::locking::lock_table::LockManager;
use crate::locking::policy::LockingPolicy;
use async_trait::async_trait;
use std::sync::Arc;

/// Releases every lock of one owner when dropped.
struct ReleaseOnDrop {
    locks: Arc<dyn LockManager>,
    owner: LockOwner,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.locks.unlock_all(&self.owner);
    }
}

pub struct NonTxLockingStrategy {
    policy: Arc<LockingPolicy>,
}

impl NonTxLockingStrategy {
    pub fn new(policy: Arc<LockingPolicy>) -> Self {
        Self { policy }
    }

    async fn lock_and_invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        if ctx.is_in_tx() {
            return Err(GridError::invalid_usage(format!(
                "{} in a transactional context of a non-transactional cache",
                command.name()
            )));
        }
        let _release = ReleaseOnDrop {
            locks: self.policy.lock_manager().clone(),
            owner: ctx.lock_owner().clone(),
        };
        let to_lock: Vec<Key> = keys
            .iter()
            .filter(|key| self.policy.should_lock_key(key))
            .cloned()
            .collect();
        let timeout = self.policy.effective_timeout(command.flags());
        match to_lock.as_slice() {
            [] => {}
            [key] => self.policy.lock_key(ctx, key, timeout).await?,
            keys => self.policy.lock_all_keys(ctx, keys, timeout).await?,
        }
        let result = next.invoke(ctx, command).await;
        ctx.clear_locked_keys();
        result
    }
}

#[async_trait]
impl LockingStrategy for NonTxLockingStrategy {
    fn name(&self) -> &'static str {
        "non-transactional"
    }

    async fn visit_read(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        _keys: &[Key],
        next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
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
        self.lock_and_invoke(ctx, command, keys, next).await
    }

    async fn visit_prepare(
        &self,
        _ctx: &mut InvocationContext,
        command: &Command,
        _prepare: &PrepareCommand,
        _next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        Err(GridError::invalid_usage(format!(
            "{} on a non-transactional cache",
            command.name()
        )))
    }

    async fn visit_lock_control(
        &self,
        _ctx: &mut InvocationContext,
        command: &Command,
        _lock_control: &LockControlCommand,
        _next: &dyn CommandInvoker,
    ) -> GridResult<CommandResult> {
        Err(GridError::invalid_usage(format!(
            "{} on a non-transactional cache",
            command.name()
        )))
    }
}
