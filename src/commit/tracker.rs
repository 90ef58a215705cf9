//! State-transfer commit tracking.
//!
//! While a rebalance pushes entries into this node, a regular write may land
//! before the (older) transferred value for the same key. Keys written by
//! regular commits are recorded while tracking is on, and transferred values
//! for those keys are discarded.

use crate::commit::decision::TrackFlag;
use crate::core::ids::Key;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Default)]
struct Tracked {
    active: bool,
    keys: HashSet<Key>,
}

/// Tracks regular writes during state transfer (in-cluster and cross-site).
#[derive(Debug, Default)]
pub struct CommitTracker {
    state_transfer: Mutex<Tracked>,
    xsite: Mutex<Tracked>,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, flag: TrackFlag) -> Option<&Mutex<Tracked>> {
        match flag {
            TrackFlag::StateTransfer => Some(&self.state_transfer),
            TrackFlag::XSiteStateTransfer => Some(&self.xsite),
            TrackFlag::Regular => None,
        }
    }

    /// Start recording regular writes for `flag`'s transfer kind.
    pub fn start_tracking(&self, flag: TrackFlag) {
        if let Some(slot) = self.slot(flag) {
            let mut tracked = slot.lock();
            tracked.active = true;
            tracked.keys.clear();
        }
    }

    /// Stop recording and forget the tracked keys.
    pub fn stop_tracking(&self, flag: TrackFlag) {
        if let Some(slot) = self.slot(flag) {
            let mut tracked = slot.lock();
            tracked.active = false;
            tracked.keys.clear();
        }
    }

    pub fn is_tracking(&self, flag: TrackFlag) -> bool {
        self.slot(flag).is_some_and(|slot| slot.lock().active)
    }

    /// Decide whether a commit of `key` with `flag` may be applied.
    ///
    /// Regular commits are always applied (and recorded while tracking).
    /// Transferred values are discarded for keys a regular commit already wrote.
    pub fn should_commit(&self, key: &Key, flag: TrackFlag) -> bool {
        match flag {
            TrackFlag::Regular => {
                for slot in [&self.state_transfer, &self.xsite] {
                    let mut tracked = slot.lock();
                    if tracked.active {
                        tracked.keys.insert(key.clone());
                    }
                }
                true
            }
            transfer => self.slot(transfer).map_or(true, |slot| {
                let tracked = slot.lock();
                !(tracked.active && tracked.keys.contains(key))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transfer_does_not_overwrite_regular_write() {
        let tracker = CommitTracker::new();
        let key = Key::from_static(b"k");
        tracker.start_tracking(TrackFlag::StateTransfer);

        assert!(tracker.should_commit(&key, TrackFlag::Regular));
        assert!(!tracker.should_commit(&key, TrackFlag::StateTransfer));
        assert!(tracker.should_commit(&Key::from_static(b"other"), TrackFlag::StateTransfer));
        assert!(tracker.should_commit(&key, TrackFlag::XSiteStateTransfer));
    }

    #[test]
    fn test_stop_tracking_forgets_keys() {
        let tracker = CommitTracker::new();
        let key = Key::from_static(b"k");
        tracker.start_tracking(TrackFlag::StateTransfer);
        tracker.should_commit(&key, TrackFlag::Regular);
        tracker.stop_tracking(TrackFlag::StateTransfer);

        assert!(!tracker.is_tracking(TrackFlag::StateTransfer));
        assert!(tracker.should_commit(&key, TrackFlag::StateTransfer));
    }
}
