//! Per-transaction bookkeeping.
//!
//! A `CacheTransaction` lives from the first operation of a transaction until
//! commit or rollback completes. It records which keys the transaction touched
//! cluster-wide, which keys this node locked for it, which keys are only
//! protected by a backup lock (the real lock lives on the primary owner), and
//! the versions observed by reads for write-skew detection.

use crate::commit::entry::{EntryVersion, Metadata};
use crate::core::error::{GridError, GridResult};
use crate::core::ids::{GlobalTxId, Key, LockOwner, TopologyId, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committed,
    RolledBack,
}

impl TxState {
    /// Check if the transaction reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Preparing, Preparing)
                | (Prepared, Preparing)
                | (Preparing, Prepared)
                | (Preparing, Committed)
                | (Prepared, Committed)
                | (Active | Preparing | Prepared, RolledBack)
        )
    }
}

/// A write recorded by a transaction, applied at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub key: Key,
    pub value: Option<Value>,
    pub metadata: Metadata,
}

#[derive(Debug)]
struct TxInner {
    state: TxState,
    topology_id: TopologyId,
    affected_keys: HashSet<Key>,
    locked_keys: HashSet<Key>,
    backup_locks: HashSet<Key>,
    /// Version observed by the first read of each key (`None` = key absent).
    read_versions: HashMap<Key, Option<EntryVersion>>,
    updated_versions: HashMap<Key, EntryVersion>,
    modifications: Vec<Modification>,
}

/// State of one transaction on one node.
#[derive(Debug)]
pub struct CacheTransaction {
    gtx: GlobalTxId,
    origin_local: bool,
    inner: Mutex<TxInner>,
    finished: watch::Sender<bool>,
}

impl CacheTransaction {
    /// Transaction started on this node.
    pub fn new_local(gtx: GlobalTxId, topology_id: TopologyId) -> Self {
        Self::new(gtx, topology_id, true)
    }

    /// Transaction started elsewhere, mirrored here by remote commands.
    pub fn new_remote(gtx: GlobalTxId, topology_id: TopologyId) -> Self {
        Self::new(gtx, topology_id, false)
    }

    fn new(gtx: GlobalTxId, topology_id: TopologyId, origin_local: bool) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            gtx,
            origin_local,
            inner: Mutex::new(TxInner {
                state: TxState::Active,
                topology_id,
                affected_keys: HashSet::new(),
                locked_keys: HashSet::new(),
                backup_locks: HashSet::new(),
                read_versions: HashMap::new(),
                updated_versions: HashMap::new(),
                modifications: Vec::new(),
            }),
            finished,
        }
    }

    pub fn gtx(&self) -> &GlobalTxId {
        &self.gtx
    }

    pub fn lock_owner(&self) -> LockOwner {
        LockOwner::Transaction(self.gtx.clone())
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin_local
    }

    /// Topology under which the transaction started (or was last retried).
    pub fn topology_id(&self) -> TopologyId {
        self.inner.lock().topology_id
    }

    pub fn set_topology_id(&self, topology_id: TopologyId) {
        self.inner.lock().topology_id = topology_id;
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&self, next: TxState) -> GridResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == next && next.is_terminal() {
            return Ok(());
        }
        if !inner.state.can_transition_to(next) {
            return Err(GridError::invalid_usage(format!(
                "transaction {} cannot move from {:?} to {:?}",
                self.gtx, inner.state, next
            )));
        }
        inner.state = next;
        Ok(())
    }

    // Affected keys

    pub fn add_affected_keys<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.affected_keys.insert(key.clone());
        }
    }

    /// Forget keys whose remote locks were given back.
    pub fn remove_affected_keys(&self, keys: &[Key]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.affected_keys.remove(key);
            inner.backup_locks.remove(key);
        }
    }

    pub fn contains_affected_key(&self, key: &Key) -> bool {
        self.inner.lock().affected_keys.contains(key)
    }

    pub fn affected_keys(&self) -> Vec<Key> {
        self.inner.lock().affected_keys.iter().cloned().collect()
    }

    // Real locks held on this node

    pub fn add_locked_key(&self, key: Key) {
        let mut inner = self.inner.lock();
        inner.backup_locks.remove(&key);
        inner.locked_keys.insert(key);
    }

    pub fn remove_locked_keys(&self, keys: &[Key]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.locked_keys.remove(key);
        }
    }

    pub fn owns_lock(&self, key: &Key) -> bool {
        self.inner.lock().locked_keys.contains(key)
    }

    pub fn locked_keys(&self) -> Vec<Key> {
        self.inner.lock().locked_keys.iter().cloned().collect()
    }

    pub fn clear_locked_keys(&self) -> Vec<Key> {
        self.inner.lock().locked_keys.drain().collect()
    }

    // Backup locks

    /// Record that the primary owner holds the real lock for this key.
    pub fn add_backup_lock(&self, key: Key) {
        let mut inner = self.inner.lock();
        if !inner.locked_keys.contains(&key) {
            inner.backup_locks.insert(key);
        }
    }

    pub fn has_backup_lock(&self, key: &Key) -> bool {
        self.inner.lock().backup_locks.contains(key)
    }

    pub fn backup_locked_keys(&self) -> Vec<Key> {
        self.inner.lock().backup_locks.iter().cloned().collect()
    }

    pub fn clear_backup_locks(&self) {
        self.inner.lock().backup_locks.clear();
    }

    /// Whether this transaction may be writing `key` (barrier lookup).
    pub fn touches_key(&self, key: &Key) -> bool {
        let inner = self.inner.lock();
        inner.locked_keys.contains(key)
            || inner.backup_locks.contains(key)
            || inner.affected_keys.contains(key)
    }

    // Reads and versions

    /// Record a read; only the first observation of a key counts.
    pub fn add_read_key(&self, key: Key, observed: Option<EntryVersion>) {
        self.inner.lock().read_versions.entry(key).or_insert(observed);
    }

    pub fn is_read(&self, key: &Key) -> bool {
        self.inner.lock().read_versions.contains_key(key)
    }

    /// Version observed at read time; `None` when the key was never read.
    pub fn read_version(&self, key: &Key) -> Option<Option<EntryVersion>> {
        self.inner.lock().read_versions.get(key).copied()
    }

    /// Every recorded read with the version it observed.
    pub fn read_versions(&self) -> Vec<(Key, Option<EntryVersion>)> {
        self.inner
            .lock()
            .read_versions
            .iter()
            .map(|(key, version)| (key.clone(), *version))
            .collect()
    }

    pub fn updated_versions(&self) -> HashMap<Key, EntryVersion> {
        self.inner.lock().updated_versions.clone()
    }

    /// Merge new versions into the existing map and return the result.
    pub fn merge_updated_versions(
        &self,
        versions: HashMap<Key, EntryVersion>,
    ) -> HashMap<Key, EntryVersion> {
        let mut inner = self.inner.lock();
        inner.updated_versions.extend(versions);
        inner.updated_versions.clone()
    }

    // Modifications

    pub fn add_modification(&self, modification: Modification) {
        let mut inner = self.inner.lock();
        inner.affected_keys.insert(modification.key.clone());
        inner.modifications.push(modification);
    }

    /// Latest modification of `key`, if the transaction wrote it.
    pub fn lookup_modification(&self, key: &Key) -> Option<Modification> {
        self.inner
            .lock()
            .modifications
            .iter()
            .rev()
            .find(|m| &m.key == key)
            .cloned()
    }

    /// Final modification per key, in first-write order.
    pub fn modifications(&self) -> Vec<Modification> {
        let inner = self.inner.lock();
        let mut latest: HashMap<&Key, &Modification> = HashMap::new();
        let mut order = Vec::new();
        for modification in &inner.modifications {
            if latest.insert(&modification.key, modification).is_none() {
                order.push(&modification.key);
            }
        }
        order
            .into_iter()
            .filter_map(|key| latest.get(key).map(|m| (*m).clone()))
            .collect()
    }

    pub fn modified_keys(&self) -> Vec<Key> {
        self.modifications().into_iter().map(|m| m.key).collect()
    }

    pub fn clear_modifications(&self) {
        self.inner.lock().modifications.clear();
    }

    // Completion

    /// Wake everything waiting for this transaction to finish.
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolve once the transaction has finished.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|finished| *finished).await;
    }
}
