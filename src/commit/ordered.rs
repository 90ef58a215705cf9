//! Per-key commit ordering.
//!
//! Every commit, activation, and passivation of a key takes an ordering
//! token first. A token is granted once the previous token for the same key
//! has been released, so operations on one key run strictly in request
//! order while waiters stay parked on a channel instead of a thread.

use crate::commit::container::{DataContainer, PersistenceStore};
use crate::commit::entry::{CacheEntry, InternalEntry};
use crate::commit::logic::ClusteringDependentLogic;
use crate::core::error::GridResult;
use crate::core::ids::{display_key, Key, SegmentId};
use crate::locking::command::CommandFlags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type Pending = Arc<Mutex<HashMap<Key, watch::Receiver<Release>>>>;

/// What a token tells its successor.
#[derive(Clone)]
enum Release {
    Held,
    Released,
    /// Dropped before being granted: wait on the predecessor instead.
    After(watch::Receiver<Release>),
}

/// Whether everything queued ahead on this chain has been released.
fn chain_released(receiver: &watch::Receiver<Release>) -> bool {
    let mut state = receiver.borrow().clone();
    while let Release::After(upstream) = state {
        state = upstream.borrow().clone();
    }
    matches!(state, Release::Released)
}

/// Issues ordering tokens.
#[derive(Default, Clone)]
pub struct KeyOrdering {
    pending: Pending,
}

impl KeyOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behind the last operation requested for `key`.
    pub fn order_on(&self, key: &Key) -> PendingOrder {
        let (done, receiver) = watch::channel(Release::Held);
        let prior = self.pending.lock().insert(key.clone(), receiver);
        PendingOrder {
            token: OrderingToken {
                key: key.clone(),
                prior,
                done,
                pending: self.pending.clone(),
            },
        }
    }

    /// Keys with an operation in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A token request waiting for its predecessor.
///
/// Dropping it before it is granted hands the wait over to the next
/// request, which then queues behind this one's predecessor.
pub struct PendingOrder {
    token: OrderingToken,
}

impl PendingOrder {
    /// Whether the token can be used without waiting.
    pub fn is_granted(&self) -> bool {
        self.token.prior.as_ref().map_or(true, chain_released)
    }

    /// Wait for the predecessor to release, then hand out the token.
    pub async fn granted(mut self) -> OrderingToken {
        while let Some(prior) = self.token.prior.as_mut() {
            let released = prior
                .wait_for(|state| !matches!(state, Release::Held))
                .await
                .map(|state| (*state).clone());
            // A dropped sender has already signalled release.
            self.token.prior = match released {
                Ok(Release::After(upstream)) => Some(upstream),
                _ => None,
            };
        }
        self.token
    }
}

/// Exclusive admission for one key. Released on drop, including on failure.
pub struct OrderingToken {
    key: Key,
    /// Predecessor still to wait for; `None` once granted.
    prior: Option<watch::Receiver<Release>>,
    done: watch::Sender<Release>,
    pending: Pending,
}

impl Drop for OrderingToken {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        let upstream = self.prior.take().filter(|prior| !chain_released(prior));
        let is_last = pending
            .get(&self.key)
            .is_some_and(|receiver| receiver.same_channel(&self.done.subscribe()));
        match upstream {
            Some(prior) => {
                if is_last {
                    pending.insert(self.key.clone(), prior.clone());
                }
                self.done.send_replace(Release::After(prior));
            }
            None => {
                if is_last {
                    pending.remove(&self.key);
                }
                self.done.send_replace(Release::Released);
            }
        }
    }
}

/// Ordering decorator around [`ClusteringDependentLogic`].
pub struct OrderedCommitLogic {
    logic: Arc<ClusteringDependentLogic>,
    ordering: KeyOrdering,
    passivation: Option<Arc<dyn PersistenceStore>>,
}

impl OrderedCommitLogic {
    pub fn new(logic: Arc<ClusteringDependentLogic>) -> Self {
        Self {
            logic,
            ordering: KeyOrdering::new(),
            passivation: None,
        }
    }

    /// Enable passivation against `store`.
    pub fn with_passivation(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.passivation = Some(store);
        self
    }

    pub fn logic(&self) -> &Arc<ClusteringDependentLogic> {
        &self.logic
    }

    pub fn ordering(&self) -> &KeyOrdering {
        &self.ordering
    }

    pub fn is_passivation_enabled(&self) -> bool {
        self.passivation.is_some()
    }

    fn container(&self) -> &Arc<dyn DataContainer> {
        self.logic.container()
    }

    /// Commit `entry` once every earlier operation on its key has finished.
    ///
    /// With passivation, residency is sampled before the write and the
    /// stale store copy is deleted after it, all inside the same window.
    pub async fn commit_entry(
        &self,
        entry: CacheEntry,
        segment: SegmentId,
        flags: CommandFlags,
        l1_invalidation: bool,
    ) -> GridResult<()> {
        let key = entry.key.clone();
        let _token = self.ordering.order_on(&key).granted().await;

        let Some(store) = &self.passivation else {
            return self
                .logic
                .commit_entry(entry, segment, flags, l1_invalidation)
                .await;
        };

        let was_resident = self.container().contains(&key);
        self.logic
            .commit_entry(entry, segment, flags, l1_invalidation)
            .await?;
        if !was_resident {
            store.delete(&key).await?;
        }
        Ok(())
    }

    /// Move the resident entry for `key` to the backing store.
    pub async fn passivate(&self, key: &Key) -> GridResult<bool> {
        let Some(store) = &self.passivation else {
            return Ok(false);
        };
        let _token = self.ordering.order_on(key).granted().await;

        let Some(entry) = self.container().remove(key) else {
            return Ok(false);
        };
        if let Err(err) = store.write(key, entry.clone()).await {
            // Keep the entry reachable.
            self.container()
                .commit(&CacheEntry::write(key.clone(), entry.value, entry.metadata));
            return Err(err);
        }
        tracing::debug!(key = %display_key(key), "entry passivated");
        Ok(true)
    }

    /// Load a passivated entry back into memory.
    pub async fn activate(&self, key: &Key) -> GridResult<Option<InternalEntry>> {
        if let Some(resident) = self.container().peek(key) {
            return Ok(Some(resident));
        }
        let Some(store) = &self.passivation else {
            return Ok(None);
        };
        let _token = self.ordering.order_on(key).granted().await;

        // Another operation may have written the key while we waited.
        if let Some(resident) = self.container().peek(key) {
            return Ok(Some(resident));
        }
        let Some(stored) = store.load(key).await? else {
            return Ok(None);
        };
        self.container().commit(&CacheEntry::write(
            key.clone(),
            stored.value,
            stored.metadata,
        ));
        store.delete(key).await?;
        tracing::debug!(key = %display_key(key), "entry activated");
        Ok(self.container().peek(key))
    }
}
