//! Clustering-dependent commit logic.
//!
//! Decides, per cache mode, whether the local node may apply a value to its
//! own storage and whether the write is authoritative (notifies listeners)
//! or a silent near-cache copy, then performs the write.
//!
//! | Variant      | Decision                                                  |
//! |--------------|-----------------------------------------------------------|
//! | Local        | always `CommitLocal`                                      |
//! | Invalidation | always `CommitLocal`                                      |
//! | Replication  | `CommitLocal` for write owners, else `NoCommit`           |
//! | Distribution | as Replication; non-owners keep an L1 copy when enabled   |
//! | Scattered    | delegated to a [`ScatteredCommitHandler`]                 |
//!
//! Replication and Distribution evaluate the decision and apply the write
//! while holding the shared topology lock, so a topology install cannot slip
//! in between.

use crate::commit::container::{Committed, DataContainer};
use crate::commit::decision::{Commit, TrackFlag};
use crate::commit::entry::{CacheEntry, EntryVersion, Metadata};
use crate::commit::notifier::{CacheEvent, CacheNotifier, EventKinds};
use crate::commit::tracker::CommitTracker;
use crate::commit::write_skew::{self, KeySpecificLogic};
use crate::control::topology::TopologyOracle;
use crate::core::error::GridResult;
use crate::core::ids::{display_key, Key, NodeId, SegmentId};
use crate::locking::command::CommandFlags;
use crate::locking::transaction::CacheTransaction;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Commit handling for scattered caches, owned by the scattered distribution layer.
#[async_trait]
pub trait ScatteredCommitHandler: Send + Sync {
    fn commit_type(&self, key: &Key, segment: SegmentId, is_removal: bool) -> Commit;

    async fn commit_entry(
        &self,
        entry: CacheEntry,
        segment: SegmentId,
        flags: CommandFlags,
    ) -> GridResult<()>;
}

/// Cache-mode specific behaviour, selected once when the cache is built.
#[derive(Clone)]
pub enum LogicVariant {
    Local,
    Invalidation,
    Replication,
    Distribution {
        /// Near-cache lifespan; `None` when L1 is disabled.
        l1_lifespan: Option<Duration>,
    },
    Scattered(Arc<dyn ScatteredCommitHandler>),
}

impl LogicVariant {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Invalidation => "invalidation",
            Self::Replication => "replication",
            Self::Distribution { .. } => "distribution",
            Self::Scattered(_) => "scattered",
        }
    }

    fn uses_topology_lock(&self) -> bool {
        matches!(self, Self::Replication | Self::Distribution { .. })
    }

    fn has_l1(&self) -> bool {
        matches!(
            self,
            Self::Distribution {
                l1_lifespan: Some(_)
            }
        )
    }
}

impl std::fmt::Debug for LogicVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Distribution { l1_lifespan } => f
                .debug_struct("Distribution")
                .field("l1_lifespan", l1_lifespan)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

pub struct ClusteringDependentLogic {
    variant: LogicVariant,
    topology: Arc<dyn TopologyOracle>,
    container: Arc<dyn DataContainer>,
    notifier: Arc<CacheNotifier>,
    tracker: Arc<CommitTracker>,
}

impl ClusteringDependentLogic {
    pub fn new(
        variant: LogicVariant,
        topology: Arc<dyn TopologyOracle>,
        container: Arc<dyn DataContainer>,
        notifier: Arc<CacheNotifier>,
        tracker: Arc<CommitTracker>,
    ) -> Self {
        Self {
            variant,
            topology,
            container,
            notifier,
            tracker,
        }
    }

    pub fn variant(&self) -> &LogicVariant {
        &self.variant
    }

    pub fn topology(&self) -> &Arc<dyn TopologyOracle> {
        &self.topology
    }

    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    pub fn primary_owner(&self, key: &Key) -> Option<NodeId> {
        self.topology.primary_owner(self.topology.segment_for(key))
    }

    /// Keys this node rechecks for write skew at commit time.
    pub fn key_specific_logic(&self) -> KeySpecificLogic {
        match self.variant {
            LogicVariant::Local | LogicVariant::Scattered(_) => KeySpecificLogic::NoKeys,
            _ => KeySpecificLogic::PrimaryOwned,
        }
    }

    /// Commit decision for a write of `key` under the current topology.
    pub fn commit_type(&self, key: &Key, segment: SegmentId, is_removal: bool) -> Commit {
        if let LogicVariant::Scattered(handler) = &self.variant {
            return handler.commit_type(key, segment, is_removal);
        }
        let _shared = self
            .variant
            .uses_topology_lock()
            .then(|| self.topology.acquire_shared_topology_lock());
        self.decide(key, segment, is_removal, false, CommandFlags::empty())
    }

    fn decide(
        &self,
        key: &Key,
        segment: SegmentId,
        is_removal: bool,
        l1_invalidation: bool,
        flags: CommandFlags,
    ) -> Commit {
        if l1_invalidation {
            // Only ever drops a near-cache copy.
            return match self.container.peek(key) {
                Some(resident) if resident.is_l1() => Commit::CommitNonLocal,
                _ => Commit::NoCommit,
            };
        }
        if flags.contains(CommandFlags::CACHE_MODE_LOCAL) {
            return Commit::CommitLocal;
        }
        match &self.variant {
            LogicVariant::Local | LogicVariant::Invalidation => Commit::CommitLocal,
            LogicVariant::Replication => {
                if self.topology.is_write_owner(segment) {
                    Commit::CommitLocal
                } else {
                    Commit::NoCommit
                }
            }
            LogicVariant::Distribution { l1_lifespan } => {
                if self.topology.is_write_owner(segment) {
                    Commit::CommitLocal
                } else if l1_lifespan.is_none() {
                    Commit::NoCommit
                } else if !is_removal {
                    Commit::CommitNonLocal
                } else {
                    Commit::NoCommit
                }
            }
            LogicVariant::Scattered(handler) => handler.commit_type(key, segment, is_removal),
        }
    }

    /// Apply `entry` to local storage according to the commit decision.
    ///
    /// The storage write happens synchronously under the topology lock;
    /// listeners are notified only for `CommitLocal`, after the storage
    /// completion resolves.
    pub async fn commit_entry(
        &self,
        entry: CacheEntry,
        segment: SegmentId,
        flags: CommandFlags,
        l1_invalidation: bool,
    ) -> GridResult<()> {
        if let LogicVariant::Scattered(handler) = &self.variant {
            return handler.commit_entry(entry, segment, flags).await;
        }

        let applied = {
            let _shared = self
                .variant
                .uses_topology_lock()
                .then(|| self.topology.acquire_shared_topology_lock());
            self.apply(entry, segment, flags, l1_invalidation)
        };
        let Some((decision, entry, committed)) = applied else {
            return Ok(());
        };

        committed.completion.await?;
        if decision.is_local() {
            let previous = committed.previous.map(|resident| resident.value);
            self.notifier
                .notify_committed(&entry.key, entry.value.as_ref(), previous.as_ref())
                .await;
        }
        Ok(())
    }

    fn apply(
        &self,
        mut entry: CacheEntry,
        segment: SegmentId,
        flags: CommandFlags,
        l1_invalidation: bool,
    ) -> Option<(Commit, CacheEntry, Committed)> {
        let is_removal = entry.value.is_none();
        let mut decision = self.decide(&entry.key, segment, is_removal, l1_invalidation, flags);
        if is_removal && !decision.is_commit() && self.variant.has_l1() {
            // The non-owner's own near-cache copy must not outlive the removal.
            decision = self.decide(&entry.key, segment, is_removal, true, flags);
        }
        if !decision.is_commit() {
            tracing::debug!(
                key = %display_key(&entry.key),
                segment,
                variant = self.variant.name(),
                "not an owner, commit skipped"
            );
            return None;
        }

        if decision == Commit::CommitNonLocal && !is_removal {
            if self
                .container
                .peek(&entry.key)
                .is_some_and(|resident| !resident.is_l1())
            {
                tracing::debug!(
                    key = %display_key(&entry.key),
                    "authoritative copy resident, near-cache write suppressed"
                );
                return None;
            }
            if let LogicVariant::Distribution {
                l1_lifespan: Some(lifespan),
            } = self.variant
            {
                entry.metadata = Metadata::l1(lifespan, entry.metadata.version);
            }
        }

        if !self
            .tracker
            .should_commit(&entry.key, TrackFlag::from_flags(flags))
        {
            tracing::debug!(
                key = %display_key(&entry.key),
                "state transfer value discarded, key written since tracking started"
            );
            return None;
        }

        let committed = self.container.commit(&entry);
        Some((decision, entry, committed))
    }

    /// Remove every resident entry.
    ///
    /// With a removal listener registered, entries are removed one at a time
    /// and each removal is notified; otherwise the container is cleared in
    /// one step without notifications. Returns the number of entries removed.
    pub async fn commit_clear(&self) -> GridResult<usize> {
        if !self.notifier.has_listener(EventKinds::REMOVED) {
            let cleared = self.container.len();
            self.container.clear();
            tracing::debug!(cleared, "container cleared");
            return Ok(cleared);
        }

        let mut removed = 0;
        for key in self.container.keys() {
            if let Some(resident) = self.container.remove(&key) {
                self.notifier
                    .notify(CacheEvent::Removed {
                        key,
                        previous: resident.value,
                    })
                    .await;
                removed += 1;
            }
        }
        tracing::debug!(removed, "container cleared entry by entry");
        Ok(removed)
    }

    /// Write-skew recheck for a versioned transactional commit.
    pub fn create_new_versions_and_check_for_write_skews(
        &self,
        tx: &CacheTransaction,
    ) -> GridResult<HashMap<Key, EntryVersion>> {
        write_skew::create_new_versions_and_check_for_write_skews(
            tx,
            self.key_specific_logic(),
            self.topology.as_ref(),
            self.container.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::container::InMemoryDataContainer;
    use crate::control::topology::{ClusterTopology, SegmentOwners, TopologySnapshot};
    use crate::core::ids::Value;
    use parking_lot::Mutex;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    /// Node `a` in a topology where every segment is owned by `b` and `c`.
    fn foreign_topology() -> Arc<ClusterTopology> {
        let members = nodes(&["a", "b", "c"]);
        let segments = (0..8)
            .map(|_| SegmentOwners::new(nodes(&["b", "c"])))
            .collect();
        Arc::new(ClusterTopology::new(
            NodeId::new("a"),
            TopologySnapshot::new(1, members, segments),
        ))
    }

    fn logic(variant: LogicVariant, topology: Arc<ClusterTopology>) -> ClusteringDependentLogic {
        ClusteringDependentLogic::new(
            variant,
            topology,
            Arc::new(InMemoryDataContainer::new()),
            Arc::new(CacheNotifier::new()),
            Arc::new(CommitTracker::new()),
        )
    }

    fn key() -> Key {
        Key::from_static(b"k")
    }

    #[test]
    fn test_local_and_invalidation_always_commit_locally() {
        let topology = foreign_topology();
        for variant in [LogicVariant::Local, LogicVariant::Invalidation] {
            let logic = logic(variant, topology.clone());
            assert_eq!(logic.commit_type(&key(), 0, false), Commit::CommitLocal);
        }
    }

    #[test]
    fn test_replication_requires_write_ownership() {
        let logic = logic(LogicVariant::Replication, foreign_topology());
        assert_eq!(logic.commit_type(&key(), 0, false), Commit::NoCommit);

        let owner = logic_for_owner(LogicVariant::Replication);
        assert_eq!(owner.commit_type(&key(), 0, false), Commit::CommitLocal);
    }

    fn logic_for_owner(variant: LogicVariant) -> ClusteringDependentLogic {
        logic(variant, Arc::new(ClusterTopology::local(NodeId::new("a"), 8)))
    }

    #[tokio::test]
    async fn test_distribution_l1_decision_table() {
        let with_l1 = logic(
            LogicVariant::Distribution {
                l1_lifespan: Some(Duration::from_secs(60)),
            },
            foreign_topology(),
        );
        assert_eq!(with_l1.commit_type(&key(), 0, false), Commit::CommitNonLocal);
        assert_eq!(with_l1.commit_type(&key(), 0, true), Commit::NoCommit);

        // A resident near-cache copy does not turn a removal into a commit.
        with_l1
            .commit_entry(
                CacheEntry::write(key(), Value::from("near"), Metadata::default()),
                0,
                CommandFlags::empty(),
                false,
            )
            .await
            .unwrap();
        assert!(with_l1.container().peek(&key()).unwrap().is_l1());
        assert_eq!(with_l1.commit_type(&key(), 0, true), Commit::NoCommit);

        // The removal itself still drops that copy.
        with_l1
            .commit_entry(CacheEntry::removal(key()), 0, CommandFlags::empty(), false)
            .await
            .unwrap();
        assert!(!with_l1.container().contains(&key()));

        let without_l1 = logic(LogicVariant::Distribution { l1_lifespan: None }, foreign_topology());
        assert_eq!(without_l1.commit_type(&key(), 0, false), Commit::NoCommit);
    }

    #[tokio::test]
    async fn test_near_cache_write_is_bounded_and_silent() {
        let logic = logic(
            LogicVariant::Distribution {
                l1_lifespan: Some(Duration::from_secs(60)),
            },
            foreign_topology(),
        );
        let events = Arc::new(Mutex::new(0));
        let counter = events.clone();
        logic.notifier.add_listener(
            EventKinds::all(),
            Arc::new(move |_: &CacheEvent| *counter.lock() += 1),
        );

        logic
            .commit_entry(
                CacheEntry::write(key(), Value::from("v"), Metadata::default()),
                0,
                CommandFlags::empty(),
                false,
            )
            .await
            .unwrap();

        let resident = logic.container().peek(&key()).unwrap();
        assert!(resident.is_l1());
        assert_eq!(resident.metadata.lifespan, Some(Duration::from_secs(60)));
        assert_eq!(*events.lock(), 0);
    }

    #[tokio::test]
    async fn test_near_cache_write_does_not_replace_authoritative_copy() {
        let logic = logic(
            LogicVariant::Distribution {
                l1_lifespan: Some(Duration::from_secs(60)),
            },
            foreign_topology(),
        );
        logic
            .container()
            .commit(&CacheEntry::write(key(), Value::from("owner"), Metadata::default()));

        logic
            .commit_entry(
                CacheEntry::write(key(), Value::from("l1"), Metadata::default()),
                0,
                CommandFlags::empty(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(logic.container().peek(&key()).unwrap().value, Value::from("owner"));
    }

    #[tokio::test]
    async fn test_l1_invalidation_only_drops_near_cache_copies() {
        let logic = logic_for_owner(LogicVariant::Distribution {
            l1_lifespan: Some(Duration::from_secs(60)),
        });
        logic
            .container()
            .commit(&CacheEntry::write(key(), Value::from("owner"), Metadata::default()));
        logic
            .commit_entry(CacheEntry::removal(key()), 0, CommandFlags::empty(), true)
            .await
            .unwrap();
        assert!(logic.container().contains(&key()));
    }

    #[tokio::test]
    async fn test_state_transfer_value_discarded_after_regular_write() {
        let logic = logic_for_owner(LogicVariant::Replication);
        logic.tracker.start_tracking(TrackFlag::StateTransfer);

        logic
            .commit_entry(
                CacheEntry::write(key(), Value::from("fresh"), Metadata::default()),
                0,
                CommandFlags::empty(),
                false,
            )
            .await
            .unwrap();
        logic
            .commit_entry(
                CacheEntry::write(key(), Value::from("stale"), Metadata::default()),
                0,
                CommandFlags::PUT_FOR_STATE_TRANSFER,
                false,
            )
            .await
            .unwrap();
        assert_eq!(logic.container().peek(&key()).unwrap().value, Value::from("fresh"));
    }

    #[tokio::test]
    async fn test_local_commit_notifies_after_write() {
        let logic = logic_for_owner(LogicVariant::Local);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        logic.notifier.add_listener(
            EventKinds::CREATED | EventKinds::MODIFIED,
            Arc::new(move |event: &CacheEvent| sink.lock().push(event.kind())),
        );

        for value in ["1", "2"] {
            logic
                .commit_entry(
                    CacheEntry::write(key(), Value::from(value), Metadata::default()),
                    0,
                    CommandFlags::empty(),
                    false,
                )
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock(), vec![EventKinds::CREATED, EventKinds::MODIFIED]);
    }

    #[test]
    fn test_key_specific_logic_per_variant() {
        assert_eq!(
            logic_for_owner(LogicVariant::Local).key_specific_logic(),
            KeySpecificLogic::NoKeys
        );
        assert_eq!(
            logic_for_owner(LogicVariant::Replication).key_specific_logic(),
            KeySpecificLogic::PrimaryOwned
        );
    }
}
