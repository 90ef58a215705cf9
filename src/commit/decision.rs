//! Commit decisions and state-transfer tracking flags.

use crate::locking::command::CommandFlags;

/// Whether and how a node applies a value to its own storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Do not write locally.
    NoCommit,
    /// Write silently: a non-authoritative (near-cache) copy.
    CommitNonLocal,
    /// Write as an authoritative owner and fire notifications.
    CommitLocal,
}

impl Commit {
    pub fn is_commit(&self) -> bool {
        !matches!(self, Self::NoCommit)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::CommitLocal)
    }
}

/// Origin of a write, as seen by the commit tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackFlag {
    /// Regular user write.
    Regular,
    /// Write pushed by in-cluster state transfer.
    StateTransfer,
    /// Write pushed by cross-site state transfer.
    XSiteStateTransfer,
}

impl TrackFlag {
    pub fn from_flags(flags: CommandFlags) -> Self {
        if flags.contains(CommandFlags::PUT_FOR_STATE_TRANSFER) {
            Self::StateTransfer
        } else if flags.contains(CommandFlags::PUT_FOR_X_SITE_STATE_TRANSFER) {
            Self::XSiteStateTransfer
        } else {
            Self::Regular
        }
    }
}
