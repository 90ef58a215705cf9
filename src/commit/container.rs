//! Data container and backing-store contracts.
//!
//! The container applies a commit synchronously and hands back a
//! `StorageCompletion` for any asynchronous work the write triggers (a
//! write-through to the backing store, for instance). Callers that must
//! observe durability await the completion; notifications are fired only
//! after it resolves.

use crate::commit::entry::{CacheEntry, EntryVersion, InternalEntry, Metadata};
use crate::core::error::GridResult;
use crate::core::ids::Key;
use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Asynchronous tail of a storage write.
pub type StorageCompletion = BoxFuture<'static, GridResult<()>>;

/// Result of applying one entry to the container.
pub struct Committed {
    /// Entry resident before the write, if any.
    pub previous: Option<InternalEntry>,

    /// Resolves once the write is durable.
    pub completion: StorageCompletion,
}

impl std::fmt::Debug for Committed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Committed")
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

/// In-memory entry storage of one node.
pub trait DataContainer: Send + Sync {
    /// Resident, unexpired entry for `key`.
    fn peek(&self, key: &Key) -> Option<InternalEntry>;

    fn contains(&self, key: &Key) -> bool {
        self.peek(key).is_some()
    }

    /// Apply `entry` (a write, or a removal when `entry.value` is `None`).
    ///
    /// Entries without an explicit version get the version following the
    /// resident one.
    fn commit(&self, entry: &CacheEntry) -> Committed;

    /// Remove `key` without touching the backing store.
    fn remove(&self, key: &Key) -> Option<InternalEntry>;

    /// Drop every resident entry in one step.
    fn clear(&self);

    /// Resident keys.
    fn keys(&self) -> Vec<Key>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backing store (cache loader/writer).
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load(&self, key: &Key) -> GridResult<Option<InternalEntry>>;

    async fn write(&self, key: &Key, entry: InternalEntry) -> GridResult<()>;

    /// Returns whether an entry was deleted.
    async fn delete(&self, key: &Key) -> GridResult<bool>;
}

/// Hash-map backed container with optional write-through.
#[derive(Default)]
pub struct InMemoryDataContainer {
    entries: RwLock<HashMap<Key, InternalEntry>>,
    write_through: Option<Arc<dyn PersistenceStore>>,
}

impl InMemoryDataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container that mirrors every commit into `store`.
    pub fn with_write_through(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            write_through: Some(store),
        }
    }

    fn completion_for(&self, key: &Key, written: Option<InternalEntry>) -> StorageCompletion {
        let Some(store) = self.write_through.clone() else {
            return future::ready(Ok(())).boxed();
        };
        let key = key.clone();
        async move {
            match written {
                Some(entry) => store.write(&key, entry).await,
                None => store.delete(&key).await.map(|_| ()),
            }
        }
        .boxed()
    }
}

impl DataContainer for InMemoryDataContainer {
    fn peek(&self, key: &Key) -> Option<InternalEntry> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    fn commit(&self, entry: &CacheEntry) -> Committed {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let previous = entries
            .remove(&entry.key)
            .filter(|resident| !resident.is_expired_at(now));

        let written = entry.value.clone().map(|value| {
            let version = entry
                .metadata
                .version
                .unwrap_or_else(|| EntryVersion::next_after(previous.as_ref().and_then(InternalEntry::version)));
            let metadata = Metadata {
                version: Some(version),
                ..entry.metadata.clone()
            };
            let resident = InternalEntry::new(value, metadata);
            entries.insert(entry.key.clone(), resident.clone());
            resident
        });
        drop(entries);

        Committed {
            previous,
            completion: self.completion_for(&entry.key, written),
        }
    }

    fn remove(&self, key: &Key) -> Option<InternalEntry> {
        self.entries.write().remove(key)
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn keys(&self) -> Vec<Key> {
        self.entries.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Map-backed store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<Key, InternalEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn load(&self, key: &Key) -> GridResult<Option<InternalEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn write(&self, key: &Key, entry: InternalEntry) -> GridResult<()> {
        self.entries.lock().insert(key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> GridResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::Value;
    use std::time::Duration;

    fn key(k: &'static str) -> Key {
        Key::from_static(k.as_bytes())
    }

    #[tokio::test]
    async fn test_commit_assigns_increasing_versions() {
        let container = InMemoryDataContainer::new();
        let first = container.commit(&CacheEntry::write(key("k"), Value::from("1"), Metadata::default()));
        first.completion.await.unwrap();
        assert!(first.previous.is_none());
        assert_eq!(container.peek(&key("k")).unwrap().version(), Some(EntryVersion(1)));

        let second = container.commit(&CacheEntry::write(key("k"), Value::from("2"), Metadata::default()));
        assert_eq!(second.previous.unwrap().value, Value::from("1"));
        assert_eq!(container.peek(&key("k")).unwrap().version(), Some(EntryVersion(2)));
    }

    #[test]
    fn test_removal_drops_entry() {
        let container = InMemoryDataContainer::new();
        container.commit(&CacheEntry::write(key("k"), Value::from("1"), Metadata::default()));
        let removed = container.commit(&CacheEntry::removal(key("k")));
        assert!(removed.previous.is_some());
        assert!(container.is_empty());
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let container = InMemoryDataContainer::new();
        container.commit(&CacheEntry::write(
            key("k"),
            Value::from("1"),
            Metadata::default().with_lifespan(Duration::ZERO),
        ));
        assert!(container.peek(&key("k")).is_none());
        assert!(!container.contains(&key("k")));
    }

    #[tokio::test]
    async fn test_write_through_completes_after_store_write() {
        let store = Arc::new(InMemoryStore::new());
        let container = InMemoryDataContainer::with_write_through(store.clone());

        let committed = container.commit(&CacheEntry::write(key("k"), Value::from("1"), Metadata::default()));
        assert!(!store.contains(&key("k")));
        committed.completion.await.unwrap();
        assert!(store.contains(&key("k")));

        container.commit(&CacheEntry::removal(key("k"))).completion.await.unwrap();
        assert!(store.is_empty());
    }
}
