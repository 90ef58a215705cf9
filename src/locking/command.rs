//! Commands flowing through the locking interceptor.

use crate::commit::entry::{EntryVersion, Metadata};
use crate::core::ids::{GlobalTxId, Key, TopologyId, Value};
use crate::locking::transaction::Modification;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

bitflags::bitflags! {
    /// Per-command behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CommandFlags: u32 {
        /// Do not acquire any lock for this command.
        const SKIP_LOCKING = 0b0000_0001;
        /// Try to lock without waiting (best-effort invalidations).
        const ZERO_LOCK_ACQUISITION_TIMEOUT = 0b0000_0010;
        /// The caller does not need the previous value.
        const IGNORE_RETURN_VALUES = 0b0000_0100;
        /// Lock the key on read (pessimistic `SELECT ... FOR UPDATE`).
        const FORCE_WRITE_LOCK = 0b0000_1000;
        /// Write issued by state transfer.
        const PUT_FOR_STATE_TRANSFER = 0b0001_0000;
        /// Write issued by cross-site state transfer.
        const PUT_FOR_X_SITE_STATE_TRANSFER = 0b0010_0000;
        /// Apply locally only, never replicate.
        const CACHE_MODE_LOCAL = 0b0100_0000;
    }
}

impl Default for CommandFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Kind of single-key write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Put,
    Remove,
    Replace,
    Compute,
    Functional,
}

/// Single-key read.
#[derive(Debug, Clone)]
pub struct ReadCommand {
    pub key: Key,
    pub flags: CommandFlags,
}

impl ReadCommand {
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            flags: CommandFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// Multi-key read.
#[derive(Debug, Clone)]
pub struct ReadManyCommand {
    pub keys: Vec<Key>,
    pub flags: CommandFlags,
}

/// Single-key write. `value == None` removes the key.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub key: Key,
    pub value: Option<Value>,
    pub kind: WriteKind,
    pub metadata: Metadata,
    pub flags: CommandFlags,
}

impl WriteCommand {
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            kind: WriteKind::Put,
            metadata: Metadata::default(),
            flags: CommandFlags::empty(),
        }
    }

    pub fn remove(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            value: None,
            kind: WriteKind::Remove,
            metadata: Metadata::default(),
            flags: CommandFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_kind(mut self, kind: WriteKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }

    /// Whether the write observes the previous value and therefore counts as a read.
    pub fn reads_previous_value(&self) -> bool {
        !self.flags.contains(CommandFlags::IGNORE_RETURN_VALUES)
            || self.flags.contains(CommandFlags::FORCE_WRITE_LOCK)
    }
}

/// Bulk put.
#[derive(Debug, Clone)]
pub struct PutMapCommand {
    pub entries: Vec<(Key, Value)>,
    pub metadata: Metadata,
    pub flags: CommandFlags,
}

impl PutMapCommand {
    pub fn keys(&self) -> Vec<Key> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Clear every resident entry.
#[derive(Debug, Clone, Default)]
pub struct ClearCommand {
    pub flags: CommandFlags,
}

/// Invalidate a set of keys (invalidation mode or L1 invalidation).
#[derive(Debug, Clone)]
pub struct InvalidateCommand {
    pub keys: Vec<Key>,
    pub flags: CommandFlags,
}

impl InvalidateCommand {
    pub fn new(keys: Vec<Key>) -> Self {
        Self {
            keys,
            flags: CommandFlags::empty(),
        }
    }

    /// Copy of this command restricted to `keys`.
    pub fn with_keys(&self, keys: Vec<Key>) -> Self {
        Self {
            keys,
            flags: self.flags,
        }
    }
}

/// Two-phase commit prepare.
#[derive(Debug, Clone)]
pub struct PrepareCommand {
    pub gtx: GlobalTxId,
    /// Keys the transaction intends to write.
    pub keys: Vec<Key>,
    pub one_phase: bool,
    /// Resubmission after a topology change.
    pub retried: bool,
    pub topology_id: TopologyId,
    pub flags: CommandFlags,
    /// Writes shipped to remote owners; empty on the originator.
    pub modifications: Vec<Modification>,
    /// Versions the originator observed on read, for the primary's write-skew check.
    pub read_versions: Vec<(Key, Option<EntryVersion>)>,
}

impl PrepareCommand {
    pub fn new(gtx: GlobalTxId, keys: Vec<Key>, one_phase: bool, topology_id: TopologyId) -> Self {
        Self {
            gtx,
            keys,
            one_phase,
            retried: false,
            topology_id,
            flags: CommandFlags::empty(),
            modifications: Vec::new(),
            read_versions: Vec::new(),
        }
    }

    pub fn as_retry(mut self) -> Self {
        self.retried = true;
        self
    }

    pub fn with_modifications(mut self, modifications: Vec<Modification>) -> Self {
        self.modifications = modifications;
        self
    }

    pub fn with_read_versions(mut self, read_versions: Vec<(Key, Option<EntryVersion>)>) -> Self {
        self.read_versions = read_versions;
        self
    }
}

/// Two-phase commit decision.
#[derive(Debug, Clone)]
pub struct CommitCommand {
    pub gtx: GlobalTxId,
    pub topology_id: TopologyId,
}

/// Transaction rollback.
#[derive(Debug, Clone)]
pub struct RollbackCommand {
    pub gtx: GlobalTxId,
}

/// Explicit lock or unlock request for a pessimistic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockControlCommand {
    pub gtx: GlobalTxId,
    pub keys: Vec<Key>,
    pub unlock: bool,
    pub topology_id: TopologyId,
    pub flags: CommandFlags,
}

impl LockControlCommand {
    pub fn lock(gtx: GlobalTxId, keys: Vec<Key>, topology_id: TopologyId) -> Self {
        Self {
            gtx,
            keys,
            unlock: false,
            topology_id,
            flags: CommandFlags::empty(),
        }
    }

    pub fn unlock(gtx: GlobalTxId, keys: Vec<Key>, topology_id: TopologyId) -> Self {
        Self {
            gtx,
            keys,
            unlock: true,
            topology_id,
            flags: CommandFlags::empty(),
        }
    }
}

/// Every command kind the interceptor accepts.
#[derive(Debug, Clone)]
pub enum Command {
    Get(ReadCommand),
    GetAll(ReadManyCommand),
    Write(WriteCommand),
    PutMap(PutMapCommand),
    Clear(ClearCommand),
    Invalidate(InvalidateCommand),
    InvalidateL1(InvalidateCommand),
    Prepare(PrepareCommand),
    Commit(CommitCommand),
    Rollback(RollbackCommand),
    LockControl(LockControlCommand),
}

impl Command {
    pub fn flags(&self) -> CommandFlags {
        match self {
            Self::Get(c) => c.flags,
            Self::GetAll(c) => c.flags,
            Self::Write(c) => c.flags,
            Self::PutMap(c) => c.flags,
            Self::Clear(c) => c.flags,
            Self::Invalidate(c) | Self::InvalidateL1(c) => c.flags,
            Self::Prepare(c) => c.flags,
            Self::LockControl(c) => c.flags,
            Self::Commit(_) | Self::Rollback(_) => CommandFlags::empty(),
        }
    }

    pub fn has_flag(&self, flag: CommandFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::GetAll(_) => "get_all",
            Self::Write(_) => "write",
            Self::PutMap(_) => "put_map",
            Self::Clear(_) => "clear",
            Self::Invalidate(_) => "invalidate",
            Self::InvalidateL1(_) => "invalidate_l1",
            Self::Prepare(_) => "prepare",
            Self::Commit(_) => "commit",
            Self::Rollback(_) => "rollback",
            Self::LockControl(_) => "lock_control",
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Empty,
    Value(Option<Value>),
    Values(HashMap<Key, Value>),
    Flag(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_reads_previous_value_unless_ignored() {
        let put = WriteCommand::put("k", "v");
        assert!(put.reads_previous_value());

        let blind = WriteCommand::put("k", "v").with_flags(CommandFlags::IGNORE_RETURN_VALUES);
        assert!(!blind.reads_previous_value());

        let forced = blind.with_flags(CommandFlags::FORCE_WRITE_LOCK);
        assert!(forced.reads_previous_value());
    }

    #[test]
    fn test_command_flags_lookup() {
        let cmd = Command::Write(
            WriteCommand::remove("k").with_flags(CommandFlags::ZERO_LOCK_ACQUISITION_TIMEOUT),
        );
        assert!(cmd.has_flag(CommandFlags::ZERO_LOCK_ACQUISITION_TIMEOUT));
        assert!(!cmd.has_flag(CommandFlags::SKIP_LOCKING));
        assert_eq!(cmd.name(), "write");
    }
}
