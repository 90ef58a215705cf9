//! Entry, metadata, and version types.

use crate::core::ids::{Key, Value};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Numeric entry version, incremented on every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryVersion(pub u64);

impl EntryVersion {
    /// Version assigned to a key's first write.
    pub const fn initial() -> Self {
        Self(1)
    }

    /// Version following `previous` (or the initial version when absent).
    pub fn next_after(previous: Option<EntryVersion>) -> Self {
        match previous {
            Some(EntryVersion(v)) => EntryVersion(v + 1),
            None => Self::initial(),
        }
    }
}

impl std::fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Entry metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Time to live after the write.
    pub lifespan: Option<Duration>,

    /// Explicit version; assigned by the container when absent.
    pub version: Option<EntryVersion>,

    /// Non-authoritative near-cache copy.
    pub l1: bool,
}

impl Metadata {
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    pub fn with_version(mut self, version: EntryVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Metadata for a near-cache copy with a bounded lifespan.
    pub fn l1(lifespan: Duration, version: Option<EntryVersion>) -> Self {
        Self {
            lifespan: Some(lifespan),
            version,
            l1: true,
        }
    }
}

/// An entry resident in the data container.
#[derive(Debug, Clone)]
pub struct InternalEntry {
    pub value: Value,
    pub metadata: Metadata,
    pub created_at: Instant,
}

impl InternalEntry {
    pub fn new(value: Value, metadata: Metadata) -> Self {
        Self {
            value,
            metadata,
            created_at: Instant::now(),
        }
    }

    pub fn version(&self) -> Option<EntryVersion> {
        self.metadata.version
    }

    pub fn is_l1(&self) -> bool {
        self.metadata.l1
    }

    /// Check if the lifespan has elapsed at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.metadata
            .lifespan
            .is_some_and(|lifespan| now.duration_since(self.created_at) >= lifespan)
    }
}

/// A context entry about to be committed. `value == None` is a removal.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Key,
    pub value: Option<Value>,
    pub metadata: Metadata,
}

impl CacheEntry {
    pub fn write(key: Key, value: Value, metadata: Metadata) -> Self {
        Self {
            key,
            value: Some(value),
            metadata,
        }
    }

    pub fn removal(key: Key) -> Self {
        Self {
            key,
            value: None,
            metadata: Metadata::default(),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.value.is_none()
    }
}
