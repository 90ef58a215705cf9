//! Write-skew detection and version generation.

use crate::commit::container::DataContainer;
use crate::commit::entry::EntryVersion;
use crate::control::topology::TopologyOracle;
use crate::core::error::{GridError, GridResult};
use crate::core::ids::Key;
use crate::locking::transaction::CacheTransaction;
use std::collections::HashMap;

/// Which keys a node checks for write skew at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpecificLogic {
    /// Single-node caches never recheck.
    NoKeys,
    /// Only the primary owner can detect a conflict authoritatively.
    PrimaryOwned,
}

impl KeySpecificLogic {
    pub fn performs_check(&self, topology: &dyn TopologyOracle, key: &Key) -> bool {
        match self {
            Self::NoKeys => false,
            Self::PrimaryOwned => topology.is_primary_owner(topology.segment_for(key)),
        }
    }
}

/// Compare the version `tx` observed for `key` with the resident one.
///
/// Keys the transaction never read pass.
pub fn check_key(
    tx: &CacheTransaction,
    key: &Key,
    container: &dyn DataContainer,
) -> GridResult<Option<EntryVersion>> {
    let current = container.peek(key).and_then(|entry| entry.version());
    match tx.read_version(key) {
        Some(observed) if observed != current => {
            tracing::debug!(
                tx = %tx.gtx(),
                key = %crate::core::ids::display_key(key),
                observed = ?observed,
                current = ?current,
                "write skew detected"
            );
            Err(GridError::write_skew(key, tx.gtx()))
        }
        _ => Ok(current),
    }
}

/// Recheck every modified key selected by `logic` and compute its next
/// version. New versions are merged into the transaction's version map,
/// and the merged map is returned.
pub fn create_new_versions_and_check_for_write_skews(
    tx: &CacheTransaction,
    logic: KeySpecificLogic,
    topology: &dyn TopologyOracle,
    container: &dyn DataContainer,
) -> GridResult<HashMap<Key, EntryVersion>> {
    let mut versions = HashMap::new();
    for key in tx.modified_keys() {
        if !logic.performs_check(topology, &key) {
            continue;
        }
        let current = check_key(tx, &key, container)?;
        versions.insert(key, EntryVersion::next_after(current));
    }
    Ok(tx.merge_updated_versions(versions))
}
