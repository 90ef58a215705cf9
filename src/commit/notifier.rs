//! Cache listeners and commit notifications.

use crate::core::ids::{Key, Value};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    /// Event kinds a listener subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventKinds: u8 {
        const CREATED = 0b001;
        const MODIFIED = 0b010;
        const REMOVED = 0b100;
    }
}

/// A change observed on an authoritative owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Created {
        key: Key,
        value: Value,
    },
    Modified {
        key: Key,
        value: Value,
        previous: Value,
    },
    Removed {
        key: Key,
        previous: Value,
    },
}

impl CacheEvent {
    /// Event for a committed write; `None` when nothing observable changed.
    pub fn for_commit(key: &Key, value: Option<&Value>, previous: Option<&Value>) -> Option<Self> {
        match (value, previous) {
            (Some(value), None) => Some(Self::Created {
                key: key.clone(),
                value: value.clone(),
            }),
            (Some(value), Some(previous)) => Some(Self::Modified {
                key: key.clone(),
                value: value.clone(),
                previous: previous.clone(),
            }),
            (None, Some(previous)) => Some(Self::Removed {
                key: key.clone(),
                previous: previous.clone(),
            }),
            (None, None) => None,
        }
    }

    pub fn kind(&self) -> EventKinds {
        match self {
            Self::Created { .. } => EventKinds::CREATED,
            Self::Modified { .. } => EventKinds::MODIFIED,
            Self::Removed { .. } => EventKinds::REMOVED,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            Self::Created { key, .. } | Self::Modified { key, .. } | Self::Removed { key, .. } => key,
        }
    }
}

/// Receives cache events.
pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Handle returned by [`CacheNotifier::add_listener`].
pub type ListenerId = u64;

struct Registration {
    id: ListenerId,
    kinds: EventKinds,
    listener: Arc<dyn CacheListener>,
}

/// Listener registry.
#[derive(Default)]
pub struct CacheNotifier {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl CacheNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, kinds: EventKinds, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push(Registration {
            id,
            kinds,
            listener,
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Check if any listener subscribes to one of `kinds`.
    pub fn has_listener(&self, kinds: EventKinds) -> bool {
        self.listeners
            .read()
            .iter()
            .any(|registration| registration.kinds.intersects(kinds))
    }

    /// Deliver `event` to its subscribers. The returned future resolves once
    /// every listener has run.
    pub fn notify(&self, event: CacheEvent) -> BoxFuture<'static, ()> {
        let kind = event.kind();
        let targets: Vec<Arc<dyn CacheListener>> = self
            .listeners
            .read()
            .iter()
            .filter(|registration| registration.kinds.contains(kind))
            .map(|registration| registration.listener.clone())
            .collect();
        if targets.is_empty() {
            return future::ready(()).boxed();
        }
        async move {
            for listener in targets {
                listener.on_event(&event);
            }
        }
        .boxed()
    }

    /// Notify the commit of `key` on an authoritative owner.
    pub fn notify_committed(
        &self,
        key: &Key,
        value: Option<&Value>,
        previous: Option<&Value>,
    ) -> BoxFuture<'static, ()> {
        match CacheEvent::for_commit(key, value, previous) {
            Some(event) => self.notify(event),
            None => future::ready(()).boxed(),
        }
    }
}
