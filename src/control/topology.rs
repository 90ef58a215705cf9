//! Topology snapshots, segment routing, and the shared topology lock.
//!
//! Keys are routed to segments using a seeded hash:
//! `segment = xxhash64(key, hash_seed) % num_segments`
//!
//! A snapshot is never mutated in place. A topology change installs a new
//! snapshot as a whole while holding the exclusive side of the topology lock,
//! so commit decisions evaluated under the shared side never observe a
//! half-installed view.

use crate::core::error::{GridError, GridResult};
use crate::core::ids::{Key, NodeId, SegmentId, TopologyId};
use parking_lot::{RwLock, RwLockReadGuard};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use twox_hash::XxHash64;

/// Owners of a single segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentOwners {
    /// Current owners; the first one is the primary owner.
    pub owners: Vec<NodeId>,

    /// Nodes receiving the segment through an in-flight rebalance.
    pub pending: Vec<NodeId>,
}

impl SegmentOwners {
    pub fn new(owners: Vec<NodeId>) -> Self {
        Self {
            owners,
            pending: Vec::new(),
        }
    }

    pub fn primary(&self) -> Option<&NodeId> {
        self.owners.first()
    }
}

/// How a node relates to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Authoritative owner; the only node allowed to take a real lock.
    Primary,
    /// Write owner that is not primary (backup or pending owner).
    Backup,
    /// Not an owner.
    NonOwner,
}

/// Immutable key ownership mapping for one cluster view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Monotonically increasing topology id.
    pub topology_id: TopologyId,

    /// Cluster members in join order.
    pub members: Vec<NodeId>,

    /// Ownership per segment, indexed by segment id.
    pub segments: Vec<SegmentOwners>,

    /// Seed for segment hashing.
    pub hash_seed: u64,
}

impl TopologySnapshot {
    /// Create a snapshot from an explicit segment layout.
    pub fn new(topology_id: TopologyId, members: Vec<NodeId>, segments: Vec<SegmentOwners>) -> Self {
        Self {
            topology_id,
            members,
            segments,
            hash_seed: 0,
        }
    }

    /// A single node owning every segment.
    pub fn single_node(node: NodeId, num_segments: u32) -> Self {
        let segments = (0..num_segments)
            .map(|_| SegmentOwners::new(vec![node.clone()]))
            .collect();
        Self::new(1, vec![node], segments)
    }

    /// Round-robin layout: segment `s` is primary-owned by `members[s % n]`
    /// and backed up by the next `num_owners - 1` members.
    pub fn balanced(
        topology_id: TopologyId,
        members: Vec<NodeId>,
        num_segments: u32,
        num_owners: u32,
    ) -> Self {
        let owners_per_segment = (num_owners as usize).min(members.len()).max(1);
        let segments = (0..num_segments as usize)
            .map(|segment| {
                let owners = (0..owners_per_segment)
                    .filter_map(|offset| {
                        if members.is_empty() {
                            None
                        } else {
                            Some(members[(segment + offset) % members.len()].clone())
                        }
                    })
                    .collect();
                SegmentOwners::new(owners)
            })
            .collect();
        Self::new(topology_id, members, segments)
    }

    /// Every member owns every segment (replicated layout).
    pub fn replicated(topology_id: TopologyId, members: Vec<NodeId>, num_segments: u32) -> Self {
        let owners = members.len() as u32;
        Self::balanced(topology_id, members, num_segments, owners)
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Route a key to its segment.
    pub fn segment_for(&self, key: &[u8]) -> SegmentId {
        compute_segment(key, self.hash_seed, self.num_segments())
    }

    /// Owners of a segment.
    pub fn owners(&self, segment: SegmentId) -> Option<&SegmentOwners> {
        self.segments.get(segment as usize)
    }

    /// Primary owner of a segment.
    pub fn primary_owner(&self, segment: SegmentId) -> Option<&NodeId> {
        self.owners(segment).and_then(SegmentOwners::primary)
    }

    /// Classify a node's relationship to a segment.
    pub fn ownership(&self, node: &NodeId, segment: SegmentId) -> Ownership {
        let Some(owners) = self.owners(segment) else {
            return Ownership::NonOwner;
        };
        if owners.primary() == Some(node) {
            Ownership::Primary
        } else if owners.owners.contains(node) || owners.pending.contains(node) {
            Ownership::Backup
        } else {
            Ownership::NonOwner
        }
    }

    /// Check if a node may write the segment (current or pending owner).
    pub fn is_write_owner(&self, node: &NodeId, segment: SegmentId) -> bool {
        self.ownership(node, segment) != Ownership::NonOwner
    }

    /// Check if a node may serve reads for the segment (current owners only).
    pub fn is_read_owner(&self, node: &NodeId, segment: SegmentId) -> bool {
        self.owners(segment)
            .is_some_and(|owners| owners.owners.contains(node))
    }

    /// Build the next snapshot with one segment re-assigned.
    pub fn with_segment(&self, segment: SegmentId, owners: SegmentOwners) -> Self {
        let mut next = self.clone();
        next.topology_id += 1;
        if let Some(slot) = next.segments.get_mut(segment as usize) {
            *slot = owners;
        }
        next
    }
}

/// Compute the segment for a key.
pub fn compute_segment(key: &[u8], hash_seed: u64, num_segments: u32) -> SegmentId {
    if num_segments == 0 {
        return 0;
    }
    let mut hasher = XxHash64::with_seed(hash_seed);
    hasher.write(key);
    (hasher.finish() % u64::from(num_segments)) as SegmentId
}

/// Read-only view of cluster ownership consumed by the locking and commit layers.
pub trait TopologyOracle: Send + Sync {
    /// The local node.
    fn local_node(&self) -> &NodeId;

    /// The current snapshot. Readers never observe a partially-updated view.
    fn current_topology(&self) -> Arc<TopologySnapshot>;

    /// Whether a rebalance is moving data between nodes.
    fn is_state_transfer_in_progress(&self) -> bool;

    /// Shared side of the topology lock; held while a commit decision is
    /// evaluated and applied.
    fn acquire_shared_topology_lock(&self) -> RwLockReadGuard<'_, ()>;

    fn topology_id(&self) -> TopologyId {
        self.current_topology().topology_id
    }

    fn segment_for(&self, key: &Key) -> SegmentId {
        self.current_topology().segment_for(key)
    }

    fn ownership(&self, segment: SegmentId) -> Ownership {
        self.current_topology().ownership(self.local_node(), segment)
    }

    fn is_primary_owner(&self, segment: SegmentId) -> bool {
        self.ownership(segment) == Ownership::Primary
    }

    fn is_write_owner(&self, segment: SegmentId) -> bool {
        self.current_topology()
            .is_write_owner(self.local_node(), segment)
    }

    fn is_read_owner(&self, segment: SegmentId) -> bool {
        self.current_topology()
            .is_read_owner(self.local_node(), segment)
    }

    fn primary_owner(&self, segment: SegmentId) -> Option<NodeId> {
        self.current_topology().primary_owner(segment).cloned()
    }
}

/// Topology holder for one node.
pub struct ClusterTopology {
    /// This node.
    local: NodeId,

    /// Current snapshot, swapped as a whole.
    current: RwLock<Arc<TopologySnapshot>>,

    /// Rebalance in progress.
    state_transfer: AtomicBool,

    /// Shared by commit decisions, exclusive for installs.
    topology_lock: RwLock<()>,
}

impl ClusterTopology {
    /// Create a topology holder with an initial snapshot.
    pub fn new(local: NodeId, initial: TopologySnapshot) -> Self {
        Self {
            local,
            current: RwLock::new(Arc::new(initial)),
            state_transfer: AtomicBool::new(false),
            topology_lock: RwLock::new(()),
        }
    }

    /// Holder for a single-node (local mode) cache.
    pub fn local(node: NodeId, num_segments: u32) -> Self {
        let snapshot = TopologySnapshot::single_node(node.clone(), num_segments);
        Self::new(node, snapshot)
    }

    /// Install a new snapshot.
    ///
    /// Topology ids must increase; installing an older or equal id is rejected.
    pub fn install(&self, snapshot: TopologySnapshot) -> GridResult<()> {
        let _exclusive = self.topology_lock.write();
        let mut current = self.current.write();
        if snapshot.topology_id <= current.topology_id {
            return Err(GridError::outdated_topology(
                snapshot.topology_id,
                current.topology_id,
            ));
        }

        tracing::info!(
            node = %self.local,
            old_topology_id = current.topology_id,
            new_topology_id = snapshot.topology_id,
            members = snapshot.members.len(),
            "topology installed"
        );
        *current = Arc::new(snapshot);
        Ok(())
    }

    /// Signal the start of a rebalance.
    pub fn start_state_transfer(&self) {
        self.state_transfer.store(true, Ordering::Release);
        tracing::debug!(node = %self.local, "state transfer started");
    }

    /// Signal the end of a rebalance.
    pub fn finish_state_transfer(&self) {
        self.state_transfer.store(false, Ordering::Release);
        tracing::debug!(node = %self.local, "state transfer finished");
    }
}

impl TopologyOracle for ClusterTopology {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    fn current_topology(&self) -> Arc<TopologySnapshot> {
        self.current.read().clone()
    }

    fn is_state_transfer_in_progress(&self) -> bool {
        self.state_transfer.load(Ordering::Acquire)
    }

    fn acquire_shared_topology_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.topology_lock.read()
    }
}
