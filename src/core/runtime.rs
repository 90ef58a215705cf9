//! Cache composition and command routing.
//!
//! Startup is two-phase:
//! 1. [`CacheBuilder::new`] validates the configuration and builds the state
//!    derived from it (transaction table, notifier, commit tracker).
//! 2. [`CacheBuilder::wire`] injects the external collaborators (topology,
//!    RPC, lock table, storage) and assembles the command chain:
//!    `LockingInterceptor -> CommitStage -> OrderedCommitLogic -> ClusteringDependentLogic`.
//!
//! [`Cache`] is the entry point for local callers and for commands arriving
//! from other nodes. It forwards writes to the nodes that own them and ships
//! transaction completion (prepare, commit, rollback) to every remote owner
//! the transaction touched.

use crate::commit::container::{DataContainer, InMemoryDataContainer, PersistenceStore};
use crate::commit::logic::{ClusteringDependentLogic, LogicVariant, ScatteredCommitHandler};
use crate::commit::notifier::{CacheListener, CacheNotifier, EventKinds, ListenerId};
use crate::commit::ordered::OrderedCommitLogic;
use crate::commit::stage::CommitStage;
use crate::commit::tracker::CommitTracker;
use crate::control::rpc::{LocalOnlyRpc, NoPartitionHandling, PartitionHandler, RpcManager};
use crate::control::topology::{ClusterTopology, TopologyOracle};
use crate::core::config::{CacheMode, Config, TransactionMode};
use crate::core::error::{GridError, GridResult};
use crate::core::ids::{GlobalTxId, IdGenerator, Key, NodeId, TopologyId, Value};
use crate::locking::barrier::PendingLockManager;
use crate::locking::command::{
    ClearCommand, Command, CommandFlags, CommandResult, CommitCommand, InvalidateCommand,
    PrepareCommand, ReadCommand, RollbackCommand, WriteCommand,
};
use crate::locking::context::InvocationContext;
use crate::locking::interceptor::{CommandInvoker, LockingInterceptor, LockingStrategy};
use crate::locking::lock_table::{KeyLockTable, LockManager};
use crate::locking::non_tx::NonTxLockingStrategy;
use crate::locking::optimistic::OptimisticLockingStrategy;
use crate::locking::pessimistic::PessimisticLockingStrategy;
use crate::locking::policy::LockingPolicy;
use crate::locking::transaction::CacheTransaction;
use crate::locking::tx_table::TransactionTable;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// External collaborators injected at wiring time.
pub struct Collaborators {
    pub topology: Arc<dyn TopologyOracle>,
    pub rpc: Arc<dyn RpcManager>,
    pub partitions: Arc<dyn PartitionHandler>,
    pub lock_manager: Arc<dyn LockManager>,
    pub container: Arc<dyn DataContainer>,
    /// Backing store; required when passivation is enabled.
    pub store: Option<Arc<dyn PersistenceStore>>,
    /// Required in scattered mode.
    pub scattered: Option<Arc<dyn ScatteredCommitHandler>>,
}

impl Collaborators {
    /// Single-node collaborators with in-memory storage and locks.
    pub fn local(node: NodeId, num_segments: u32) -> Self {
        Self::clustered(
            Arc::new(ClusterTopology::local(node, num_segments)),
            Arc::new(LocalOnlyRpc),
        )
    }

    /// Collaborators for a cluster member; storage and locks are in-memory.
    pub fn clustered(topology: Arc<dyn TopologyOracle>, rpc: Arc<dyn RpcManager>) -> Self {
        Self {
            topology,
            rpc,
            partitions: Arc::new(NoPartitionHandling),
            lock_manager: Arc::new(KeyLockTable::new()),
            container: Arc::new(InMemoryDataContainer::new()),
            store: None,
            scattered: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_container(mut self, container: Arc<dyn DataContainer>) -> Self {
        self.container = container;
        self
    }

    pub fn with_partition_handler(mut self, partitions: Arc<dyn PartitionHandler>) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_scattered_handler(mut self, handler: Arc<dyn ScatteredCommitHandler>) -> Self {
        self.scattered = Some(handler);
        self
    }
}

/// First startup phase: configuration-derived state.
pub struct CacheBuilder {
    config: Arc<Config>,
    node: NodeId,
    transactions: Arc<TransactionTable>,
    notifier: Arc<CacheNotifier>,
    tracker: Arc<CommitTracker>,
}

impl CacheBuilder {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let node = NodeId::new(config.cluster.node_id.clone());
        Ok(Self {
            config: Arc::new(config),
            node,
            transactions: Arc::new(TransactionTable::new()),
            notifier: Arc::new(CacheNotifier::new()),
            tracker: Arc::new(CommitTracker::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Second startup phase: inject collaborators and assemble the chain.
    pub fn wire(self, collaborators: Collaborators) -> Result<Cache> {
        let Collaborators {
            topology,
            rpc,
            partitions,
            lock_manager,
            container,
            store,
            scattered,
        } = collaborators;
        let config = self.config;

        if topology.local_node() != &self.node {
            anyhow::bail!(
                "topology local node {} does not match cluster.node_id {}",
                topology.local_node(),
                self.node
            );
        }

        let variant = match config.cluster.cache_mode {
            CacheMode::Local => LogicVariant::Local,
            CacheMode::Invalidation => LogicVariant::Invalidation,
            CacheMode::Replicated => LogicVariant::Replication,
            CacheMode::Distributed => LogicVariant::Distribution {
                l1_lifespan: config.l1.enabled.then(|| config.l1.lifespan()),
            },
            CacheMode::Scattered => LogicVariant::Scattered(
                scattered.context("scattered mode requires a scattered commit handler")?,
            ),
        };

        // Every invalidation-mode node keeps, and locks, its own full copy.
        let lock_topology: Arc<dyn TopologyOracle> = match config.cluster.cache_mode {
            CacheMode::Invalidation => Arc::new(ClusterTopology::local(
                self.node.clone(),
                config.cluster.num_segments,
            )),
            _ => topology.clone(),
        };

        let logic = Arc::new(ClusteringDependentLogic::new(
            variant,
            lock_topology.clone(),
            container.clone(),
            self.notifier.clone(),
            self.tracker.clone(),
        ));
        let mut ordered = OrderedCommitLogic::new(logic);
        if config.persistence.passivation {
            let store = store.context("passivation requires a persistence store")?;
            ordered = ordered.with_passivation(store);
        }
        let commit = Arc::new(ordered);

        let tracks_reads = config.tracks_read_versions();
        let stage = Arc::new(CommitStage::new(
            commit.clone(),
            lock_topology.clone(),
            config.transaction.mode == TransactionMode::Optimistic && tracks_reads,
        ));

        let policy = Arc::new(LockingPolicy::new(
            lock_manager.clone(),
            lock_topology,
            PendingLockManager::new(self.transactions.clone()),
            partitions,
            container.clone(),
            config.lock_acquisition_timeout(),
        ));
        let strategy: Arc<dyn LockingStrategy> = match config.transaction.mode {
            TransactionMode::NonTransactional => Arc::new(NonTxLockingStrategy::new(policy.clone())),
            TransactionMode::Optimistic => {
                Arc::new(OptimisticLockingStrategy::new(policy.clone(), tracks_reads))
            }
            TransactionMode::Pessimistic => {
                Arc::new(PessimisticLockingStrategy::new(policy.clone(), rpc.clone()))
            }
        };
        let interceptor = LockingInterceptor::new(policy, strategy, stage);

        tracing::info!(
            node = %self.node,
            cache_mode = ?config.cluster.cache_mode,
            locking = interceptor.strategy_name(),
            passivation = commit.is_passivation_enabled(),
            "cache wired"
        );

        Ok(Cache {
            ids: IdGenerator::new(self.node.clone()),
            node: self.node,
            config,
            transactions: self.transactions,
            notifier: self.notifier,
            tracker: self.tracker,
            commit,
            interceptor,
            topology,
            rpc,
            container,
            lock_manager,
        })
    }
}

/// A wired cache on one node.
pub struct Cache {
    config: Arc<Config>,
    node: NodeId,
    ids: IdGenerator,
    transactions: Arc<TransactionTable>,
    notifier: Arc<CacheNotifier>,
    tracker: Arc<CommitTracker>,
    commit: Arc<OrderedCommitLogic>,
    interceptor: LockingInterceptor,
    topology: Arc<dyn TopologyOracle>,
    rpc: Arc<dyn RpcManager>,
    container: Arc<dyn DataContainer>,
    lock_manager: Arc<dyn LockManager>,
}

impl Cache {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn commit_logic(&self) -> &Arc<OrderedCommitLogic> {
        &self.commit
    }

    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    pub fn notifier(&self) -> &Arc<CacheNotifier> {
        &self.notifier
    }

    pub fn commit_tracker(&self) -> &Arc<CommitTracker> {
        &self.tracker
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.lock_manager
    }

    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    pub fn topology(&self) -> &Arc<dyn TopologyOracle> {
        &self.topology
    }

    pub fn add_listener(&self, kinds: EventKinds, listener: Arc<dyn CacheListener>) -> ListenerId {
        self.notifier.add_listener(kinds, listener)
    }

    // Contexts

    /// Start a transaction on this node.
    pub fn begin_transaction(&self) -> GridResult<Arc<CacheTransaction>> {
        if !self.config.transaction.mode.is_transactional() {
            return Err(GridError::invalid_usage(
                "transactions are not enabled on this cache",
            ));
        }
        let tx = self
            .transactions
            .begin_local(self.ids.next_tx(), self.topology.topology_id());
        tracing::debug!(tx = %tx.gtx(), topology_id = tx.topology_id(), "transaction started");
        Ok(tx)
    }

    pub fn tx_context(&self, tx: &Arc<CacheTransaction>) -> InvocationContext {
        InvocationContext::tx(tx.clone())
    }

    /// Context for one local non-transactional command.
    pub fn non_tx_context(&self) -> InvocationContext {
        InvocationContext::non_tx(self.ids.next_command(), true)
    }

    /// Context for a command another node sent on behalf of `gtx`.
    pub fn remote_context(&self, gtx: &GlobalTxId, topology_id: TopologyId) -> InvocationContext {
        InvocationContext::tx(self.transactions.get_or_create_remote(gtx, topology_id))
    }

    // Command entry points

    /// Run a command issued on this node.
    pub async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
    ) -> GridResult<CommandResult> {
        if ctx.is_in_tx() {
            return match command {
                Command::Prepare(prepare) => self.prepare_local(ctx, prepare).await,
                Command::Commit(commit) => self.commit_local(ctx, commit).await,
                Command::Rollback(rollback) => self.rollback_local(ctx, rollback).await,
                other => self.interceptor.invoke(ctx, &other).await,
            };
        }
        match command {
            Command::Write(write) => self.route_write(ctx, write).await,
            Command::PutMap(put_map) => {
                for (key, value) in put_map.entries {
                    let write = WriteCommand::put(key, value)
                        .with_flags(put_map.flags)
                        .with_metadata(put_map.metadata.clone());
                    self.route_write(ctx, write).await?;
                }
                Ok(CommandResult::Empty)
            }
            Command::Clear(clear) => self.clear_everywhere(ctx, clear).await,
            other => self.interceptor.invoke(ctx, &other).await,
        }
    }

    /// Run a command sent by another node.
    pub async fn handle_remote(&self, command: Command) -> GridResult<CommandResult> {
        let tx_ref = match &command {
            Command::Prepare(c) => Some((c.gtx.clone(), c.topology_id)),
            Command::Commit(c) => Some((c.gtx.clone(), c.topology_id)),
            Command::LockControl(c) => Some((c.gtx.clone(), c.topology_id)),
            Command::Rollback(c) => Some((c.gtx.clone(), self.topology.topology_id())),
            _ => None,
        };
        let Some((gtx, topology_id)) = tx_ref else {
            let mut ctx = InvocationContext::non_tx(self.ids.next_command(), false);
            return match command {
                Command::Write(write) if !write.flags.contains(CommandFlags::CACHE_MODE_LOCAL) => {
                    self.write_as_primary(&mut ctx, write).await
                }
                other => self.interceptor.invoke(&mut ctx, &other).await,
            };
        };

        let mut ctx = self.remote_context(&gtx, topology_id);
        let result = self.interceptor.invoke(&mut ctx, &command).await;
        let completes = match &command {
            Command::Commit(_) | Command::Rollback(_) => true,
            Command::Prepare(prepare) => prepare.one_phase || result.is_err(),
            _ => false,
        };
        if completes {
            self.transactions.complete(&gtx);
        }
        result
    }

    // Convenience API

    pub async fn get(&self, ctx: &mut InvocationContext, key: impl Into<Key>) -> GridResult<Option<Value>> {
        match self.invoke(ctx, Command::Get(ReadCommand::new(key))).await? {
            CommandResult::Value(value) => Ok(value),
            other => Err(GridError::internal(format!("unexpected get result {other:?}"))),
        }
    }

    pub async fn put(
        &self,
        ctx: &mut InvocationContext,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> GridResult<Option<Value>> {
        self.write(ctx, WriteCommand::put(key, value)).await
    }

    pub async fn remove(&self, ctx: &mut InvocationContext, key: impl Into<Key>) -> GridResult<Option<Value>> {
        self.write(ctx, WriteCommand::remove(key)).await
    }

    pub async fn write(
        &self,
        ctx: &mut InvocationContext,
        command: WriteCommand,
    ) -> GridResult<Option<Value>> {
        match self.invoke(ctx, Command::Write(command)).await? {
            CommandResult::Value(previous) => Ok(previous),
            _ => Ok(None),
        }
    }

    pub async fn clear(&self, ctx: &mut InvocationContext) -> GridResult<()> {
        self.invoke(ctx, Command::Clear(ClearCommand::default()))
            .await
            .map(|_| ())
    }

    /// Prepare and commit `tx`, in one phase when configured to.
    ///
    /// A failed prepare rolls the transaction back before the error is returned.
    pub async fn commit(&self, tx: &Arc<CacheTransaction>) -> GridResult<()> {
        let mut ctx = self.tx_context(tx);
        let one_phase = self.config.transaction.use_one_phase_commit;
        let prepare = PrepareCommand::new(
            tx.gtx().clone(),
            tx.modified_keys(),
            one_phase,
            tx.topology_id(),
        );
        if let Err(err) = self.invoke(&mut ctx, Command::Prepare(prepare)).await {
            if !tx.state().is_terminal() {
                self.rollback(tx).await?;
            }
            return Err(err);
        }
        if !one_phase {
            let commit = CommitCommand {
                gtx: tx.gtx().clone(),
                topology_id: tx.topology_id(),
            };
            self.invoke(&mut ctx, Command::Commit(commit)).await?;
        }
        Ok(())
    }

    pub async fn rollback(&self, tx: &Arc<CacheTransaction>) -> GridResult<()> {
        let mut ctx = self.tx_context(tx);
        let rollback = RollbackCommand {
            gtx: tx.gtx().clone(),
        };
        self.invoke(&mut ctx, Command::Rollback(rollback))
            .await
            .map(|_| ())
    }

    // Non-transactional routing

    fn routes_writes(&self) -> bool {
        matches!(
            self.config.cluster.cache_mode,
            CacheMode::Replicated | CacheMode::Distributed
        )
    }

    async fn route_write(
        &self,
        ctx: &mut InvocationContext,
        write: WriteCommand,
    ) -> GridResult<CommandResult> {
        if self.config.cluster.cache_mode == CacheMode::Invalidation {
            let key = write.key.clone();
            let result = self.interceptor.invoke(ctx, &Command::Write(write)).await?;
            self.broadcast_invalidation(vec![key]).await;
            return Ok(result);
        }
        if !self.routes_writes() || write.flags.contains(CommandFlags::CACHE_MODE_LOCAL) {
            return self.interceptor.invoke(ctx, &Command::Write(write)).await;
        }
        let segment = self.topology.segment_for(&write.key);
        match self.topology.primary_owner(segment) {
            Some(primary) if primary != self.node => {
                tracing::debug!(primary = %primary, segment, "forwarding write to primary owner");
                self.rpc
                    .invoke_remotely(&primary, Command::Write(write))
                    .await
            }
            _ => self.write_as_primary(ctx, write).await,
        }
    }

    /// Apply a write locally, then copy it to the other write owners.
    async fn write_as_primary(
        &self,
        ctx: &mut InvocationContext,
        write: WriteCommand,
    ) -> GridResult<CommandResult> {
        let segment = self.topology.segment_for(&write.key);
        let backup = write.clone().with_flags(CommandFlags::CACHE_MODE_LOCAL);
        let result = self.interceptor.invoke(ctx, &Command::Write(write)).await?;
        if !self.routes_writes() {
            return Ok(result);
        }

        let snapshot = self.topology.current_topology();
        let backups: Vec<NodeId> = snapshot
            .owners(segment)
            .map(|owners| owners.owners.iter().chain(owners.pending.iter()))
            .into_iter()
            .flatten()
            .filter(|node| **node != self.node)
            .cloned()
            .collect();
        for target in &backups {
            self.rpc
                .invoke_remotely(target, Command::Write(backup.clone()))
                .await?;
        }
        Ok(result)
    }

    async fn clear_everywhere(
        &self,
        ctx: &mut InvocationContext,
        clear: ClearCommand,
    ) -> GridResult<CommandResult> {
        let result = self
            .interceptor
            .invoke(ctx, &Command::Clear(clear.clone()))
            .await?;
        if self.config.cluster.cache_mode.is_clustered()
            && !clear.flags.contains(CommandFlags::CACHE_MODE_LOCAL)
        {
            let local_clear = ClearCommand {
                flags: clear.flags | CommandFlags::CACHE_MODE_LOCAL,
            };
            for member in self.other_members() {
                self.rpc
                    .invoke_remotely(&member, Command::Clear(local_clear.clone()))
                    .await?;
            }
        }
        Ok(result)
    }

    fn other_members(&self) -> Vec<NodeId> {
        self.topology
            .current_topology()
            .members
            .iter()
            .filter(|member| **member != self.node)
            .cloned()
            .collect()
    }

    /// Invalidation is best effort: a peer that cannot be reached keeps a
    /// copy that will be refreshed by its next write.
    async fn broadcast_invalidation(&self, keys: Vec<Key>) {
        if keys.is_empty() {
            return;
        }
        for member in self.other_members() {
            let command = Command::Invalidate(InvalidateCommand::new(keys.clone()));
            if let Err(err) = self.rpc.invoke_remotely(&member, command).await {
                tracing::warn!(member = %member, error = %err, "invalidation not delivered");
            }
        }
    }

    // Transaction completion

    /// Remote nodes involved in `tx`: every write owner of a key it touched.
    fn remote_participants(&self, tx: &CacheTransaction) -> Vec<NodeId> {
        if !self.routes_writes() {
            return Vec::new();
        }
        let snapshot = self.topology.current_topology();
        let mut participants = BTreeSet::new();
        let keys = tx.affected_keys().into_iter().chain(tx.modified_keys());
        for key in keys {
            if let Some(owners) = snapshot.owners(snapshot.segment_for(&key)) {
                participants.extend(owners.owners.iter().chain(owners.pending.iter()).cloned());
            }
        }
        participants.remove(&self.node);
        participants.into_iter().collect()
    }

    async fn prepare_local(
        &self,
        ctx: &mut InvocationContext,
        mut prepare: PrepareCommand,
    ) -> GridResult<CommandResult> {
        let Some(tx) = ctx.transaction().cloned() else {
            return Err(GridError::invalid_usage("prepare outside a transaction"));
        };
        tx.add_affected_keys(&prepare.keys);
        let participants = self.remote_participants(&tx);

        // Applying at prepare is only safe when no other owner can still reject it.
        let requested_one_phase = prepare.one_phase;
        prepare.one_phase = requested_one_phase && participants.is_empty();
        let shipped = prepare
            .clone()
            .with_modifications(tx.modifications())
            .with_read_versions(tx.read_versions());
        let result = self
            .interceptor
            .invoke(ctx, &Command::Prepare(prepare.clone()))
            .await?;

        for target in &participants {
            self.rpc
                .invoke_remotely(target, Command::Prepare(shipped.clone()))
                .await?;
        }
        if prepare.one_phase {
            self.finish_transaction(&tx).await;
        } else if requested_one_phase {
            let commit = CommitCommand {
                gtx: tx.gtx().clone(),
                topology_id: tx.topology_id(),
            };
            self.commit_local(ctx, commit).await?;
        }
        Ok(result)
    }

    async fn commit_local(
        &self,
        ctx: &mut InvocationContext,
        commit: CommitCommand,
    ) -> GridResult<CommandResult> {
        let Some(tx) = ctx.transaction().cloned() else {
            return Err(GridError::invalid_usage("commit outside a transaction"));
        };
        let result = self
            .interceptor
            .invoke(ctx, &Command::Commit(commit.clone()))
            .await?;
        for target in self.remote_participants(&tx) {
            self.rpc
                .invoke_remotely(&target, Command::Commit(commit.clone()))
                .await?;
        }
        self.finish_transaction(&tx).await;
        Ok(result)
    }

    async fn rollback_local(
        &self,
        ctx: &mut InvocationContext,
        rollback: RollbackCommand,
    ) -> GridResult<CommandResult> {
        let Some(tx) = ctx.transaction().cloned() else {
            return Err(GridError::invalid_usage("rollback outside a transaction"));
        };
        let result = self
            .interceptor
            .invoke(ctx, &Command::Rollback(rollback.clone()))
            .await;
        for target in self.remote_participants(&tx) {
            if let Err(err) = self
                .rpc
                .invoke_remotely(&target, Command::Rollback(rollback.clone()))
                .await
            {
                tracing::warn!(tx = %tx.gtx(), target = %target, error = %err, "rollback not delivered");
            }
        }
        self.transactions.complete(tx.gtx());
        result
    }

    async fn finish_transaction(&self, tx: &CacheTransaction) {
        if self.config.cluster.cache_mode == CacheMode::Invalidation {
            self.broadcast_invalidation(tx.modified_keys()).await;
        }
        self.transactions.complete(tx.gtx());
    }
}
