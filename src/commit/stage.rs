//! Terminal stage: applies commands to storage.
//!
//! Non-transactional writes commit immediately through the ordered commit
//! logic. Transactional writes are recorded on the transaction and applied
//! at commit (or at a one-phase prepare).

use crate::commit::entry::{CacheEntry, InternalEntry};
use crate::commit::ordered::OrderedCommitLogic;
use crate::control::topology::TopologyOracle;
use crate::core::error::{GridError, GridResult};
use crate::core::ids::{Key, Value};
use crate::locking::command::{
    Command, CommandFlags, CommandResult, PrepareCommand, WriteCommand, WriteKind,
};
use crate::locking::context::InvocationContext;
use crate::locking::interceptor::CommandInvoker;
use crate::locking::transaction::{CacheTransaction, Modification, TxState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct CommitStage {
    commit: Arc<OrderedCommitLogic>,
    topology: Arc<dyn TopologyOracle>,
    /// Versioned commits recheck write skew at prepare.
    versioned: bool,
}

impl CommitStage {
    pub fn new(
        commit: Arc<OrderedCommitLogic>,
        topology: Arc<dyn TopologyOracle>,
        versioned: bool,
    ) -> Self {
        Self {
            commit,
            topology,
            versioned,
        }
    }

    async fn resident(&self, key: &Key) -> GridResult<Option<InternalEntry>> {
        if self.commit.is_passivation_enabled() {
            self.commit.activate(key).await
        } else {
            Ok(self.commit.logic().container().peek(key))
        }
    }

    /// Value visible to `ctx`: its own uncommitted write first, then storage.
    async fn visible_value(&self, ctx: &InvocationContext, key: &Key) -> GridResult<Option<Value>> {
        if let Some(modification) = ctx.transaction().and_then(|tx| tx.lookup_modification(key)) {
            return Ok(modification.value);
        }
        Ok(self.resident(key).await?.map(|entry| entry.value))
    }

    async fn write(
        &self,
        ctx: &InvocationContext,
        command: &WriteCommand,
    ) -> GridResult<Option<Value>> {
        let previous = self.visible_value(ctx, &command.key).await?;
        if command.kind == WriteKind::Replace && previous.is_none() {
            return Ok(None);
        }
        match ctx.transaction() {
            Some(tx) => tx.add_modification(Modification {
                key: command.key.clone(),
                value: command.value.clone(),
                metadata: command.metadata.clone(),
            }),
            None => {
                let entry = CacheEntry {
                    key: command.key.clone(),
                    value: command.value.clone(),
                    metadata: command.metadata.clone(),
                };
                let segment = self.topology.segment_for(&command.key);
                self.commit
                    .commit_entry(entry, segment, command.flags, false)
                    .await?;
            }
        }
        Ok(previous)
    }

    async fn apply_modifications(&self, tx: &CacheTransaction) -> GridResult<()> {
        let versions = tx.updated_versions();
        for modification in tx.modifications() {
            let mut metadata = modification.metadata;
            if let Some(version) = versions.get(&modification.key) {
                metadata.version = Some(*version);
            }
            let segment = self.topology.segment_for(&modification.key);
            let entry = CacheEntry {
                key: modification.key,
                value: modification.value,
                metadata,
            };
            self.commit
                .commit_entry(entry, segment, CommandFlags::empty(), false)
                .await?;
        }
        Ok(())
    }

    async fn prepare(&self, tx: &CacheTransaction, command: &PrepareCommand) -> GridResult<()> {
        tx.transition(TxState::Preparing)?;
        for modification in &command.modifications {
            tx.add_modification(modification.clone());
        }
        if self.versioned {
            self.commit
                .logic()
                .create_new_versions_and_check_for_write_skews(tx)?;
        }
        if command.one_phase {
            self.apply_modifications(tx).await?;
            tx.transition(TxState::Committed)
        } else {
            tx.transition(TxState::Prepared)
        }
    }

    async fn commit_tx(&self, tx: &CacheTransaction) -> GridResult<()> {
        if tx.state() == TxState::Active {
            tx.transition(TxState::Preparing)?;
        }
        self.apply_modifications(tx).await?;
        tx.transition(TxState::Committed)
    }
}

fn require_tx<'a>(ctx: &'a InvocationContext, command: &Command) -> GridResult<&'a Arc<CacheTransaction>> {
    ctx.transaction().ok_or_else(|| {
        GridError::invalid_usage(format!("{} requires a transactional context", command.name()))
    })
}

#[async_trait]
impl CommandInvoker for CommitStage {
    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> GridResult<CommandResult> {
        match command {
            Command::Get(read) => Ok(CommandResult::Value(self.visible_value(ctx, &read.key).await?)),
            Command::GetAll(read) => {
                let mut values = HashMap::new();
                for key in &read.keys {
                    if let Some(value) = self.visible_value(ctx, key).await? {
                        values.insert(key.clone(), value);
                    }
                }
                Ok(CommandResult::Values(values))
            }
            Command::Write(write) => Ok(CommandResult::Value(self.write(ctx, write).await?)),
            Command::PutMap(put_map) => {
                for (key, value) in &put_map.entries {
                    let write = WriteCommand::put(key.clone(), value.clone())
                        .with_flags(put_map.flags)
                        .with_metadata(put_map.metadata.clone());
                    self.write(ctx, &write).await?;
                }
                Ok(CommandResult::Empty)
            }
            Command::Clear(_) => {
                self.commit.logic().commit_clear().await?;
                Ok(CommandResult::Empty)
            }
            Command::Invalidate(invalidate) | Command::InvalidateL1(invalidate) => {
                let l1_invalidation = matches!(command, Command::InvalidateL1(_));
                for key in &invalidate.keys {
                    self.commit
                        .commit_entry(
                            CacheEntry::removal(key.clone()),
                            self.topology.segment_for(key),
                            invalidate.flags,
                            l1_invalidation,
                        )
                        .await?;
                }
                Ok(CommandResult::Empty)
            }
            Command::Prepare(prepare) => {
                let tx = require_tx(ctx, command)?.clone();
                self.prepare(&tx, prepare).await?;
                Ok(CommandResult::Flag(true))
            }
            Command::Commit(_) => {
                let tx = require_tx(ctx, command)?.clone();
                self.commit_tx(&tx).await?;
                Ok(CommandResult::Empty)
            }
            Command::Rollback(_) => {
                let tx = require_tx(ctx, command)?.clone();
                tx.clear_modifications();
                tx.transition(TxState::RolledBack)?;
                Ok(CommandResult::Empty)
            }
            Command::LockControl(_) => Ok(CommandResult::Flag(true)),
        }
    }
}
