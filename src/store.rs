//! Storage interface for replica databases.
//!
//! The repair engine owns no persistent state itself: it reads and mutates a
//! node's database exclusively through the [`Store`] trait. Entries carry the
//! transactional lock fields of their owner; resolves respect those locks and
//! are idempotent with respect to `(key, version)`.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::keys::{Quadrant, RingKey};
use crate::merkle::NodeHash;

pub mod memory;

/// A database entry: key, optional value, version and lock state.
///
/// Invariant: an entry never holds the write lock and read locks at the same
/// time. An entry without a value is "empty" and may exist transiently to
/// carry locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The replica key this entry is stored under.
    pub key: RingKey,
    /// The value, if any.
    pub value: Option<Bytes>,
    /// Version, incremented by the owner on every write.
    pub version: u64,
    /// Exclusive write lock.
    pub write_lock: bool,
    /// Stacking read locks.
    pub read_lock: u32,
}

/// Lock transitions that would violate the entry invariant.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("entry holds read locks")]
    ReadLocked,
    #[error("entry holds the write lock")]
    WriteLocked,
    #[error("no read lock held")]
    NotReadLocked,
}

impl Entry {
    /// An empty entry at version zero.
    pub fn empty(key: RingKey) -> Self {
        Entry {
            key,
            value: None,
            version: 0,
            write_lock: false,
            read_lock: 0,
        }
    }

    /// A value-carrying entry without locks.
    pub fn with_value(key: RingKey, value: impl Into<Bytes>, version: u64) -> Self {
        Entry {
            key,
            value: Some(value.into()),
            version,
            write_lock: false,
            read_lock: 0,
        }
    }

    /// Whether the entry has no value.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Whether any lock is held.
    pub fn is_locked(&self) -> bool {
        self.write_lock || self.read_lock > 0
    }

    /// Take or release the write lock.
    pub fn set_write_lock(&mut self, locked: bool) -> Result<(), LockError> {
        if locked && self.read_lock > 0 {
            return Err(LockError::ReadLocked);
        }
        self.write_lock = locked;
        Ok(())
    }

    /// Stack one read lock.
    pub fn acquire_read_lock(&mut self) -> Result<(), LockError> {
        if self.write_lock {
            return Err(LockError::WriteLocked);
        }
        self.read_lock += 1;
        Ok(())
    }

    /// Release one read lock.
    pub fn release_read_lock(&mut self) -> Result<(), LockError> {
        if self.read_lock == 0 {
            return Err(LockError::NotReadLocked);
        }
        self.read_lock -= 1;
        Ok(())
    }

    /// Fingerprint of the entry as seen by summaries: the canonical
    /// replica-group key, the version and the value. Identical replicas hash
    /// identically regardless of the quadrant they are stored in.
    pub fn item_hash(&self) -> NodeHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"entry");
        hasher.update(&self.key.base().value().to_be_bytes());
        hasher.update(&self.version.to_le_bytes());
        match &self.value {
            Some(value) => {
                hasher.update(&[1]);
                hasher.update(value);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        NodeHash(hasher.finalize().into())
    }

    /// The same entry re-keyed into quadrant `to`, locks cleared. Used when
    /// shipping an entry to the replica holder of another quadrant.
    pub fn rekeyed(&self, to: Quadrant) -> Entry {
        Entry {
            key: self.key.base().replica(to),
            value: self.value.clone(),
            version: self.version,
            write_lock: false,
            read_lock: 0,
        }
    }
}

/// What kinds of divergence a repair round is allowed to heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// Only replace stale entries.
    Update,
    /// Only recreate missing entries.
    Regen,
    /// Both.
    Mixed,
}

impl RepairKind {
    pub fn allows_update(self) -> bool {
        matches!(self, RepairKind::Update | RepairKind::Mixed)
    }

    pub fn allows_regen(self) -> bool {
        matches!(self, RepairKind::Regen | RepairKind::Mixed)
    }
}

/// Result of applying one resolve to the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The entry was missing and has been recreated.
    Regenerated,
    /// A stale entry was replaced by a newer version.
    Updated,
    /// Nothing to do: already current, stale incoming, or filtered by the
    /// repair kind.
    Unchanged,
    /// Same version, different value. Never overwritten.
    Conflict,
    /// The local entry is write-locked; skipped.
    Locked,
}

/// Entries written and keys deleted since change recording was armed.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub written: Vec<Entry>,
    pub deleted: Vec<RingKey>,
}

/// Resolution decision shared by store implementations: newest version wins,
/// equal versions with differing values are a conflict, locks are respected.
pub fn resolve_entry(
    local: Option<&Entry>,
    incoming: &Entry,
    kind: RepairKind,
) -> ResolveOutcome {
    match local {
        None => {
            if kind.allows_regen() {
                ResolveOutcome::Regenerated
            } else {
                ResolveOutcome::Unchanged
            }
        }
        Some(local) => {
            if incoming.version > local.version {
                if !kind.allows_update() {
                    ResolveOutcome::Unchanged
                } else if local.write_lock {
                    ResolveOutcome::Locked
                } else {
                    ResolveOutcome::Updated
                }
            } else if incoming.version == local.version && incoming.value != local.value {
                ResolveOutcome::Conflict
            } else {
                ResolveOutcome::Unchanged
            }
        }
    }
}

/// Interface between the repair engine and a node's database.
pub trait Store: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Read a single entry.
    fn get(&self, key: RingKey) -> Result<Option<Entry>>;

    /// Insert or overwrite an entry.
    fn put(&self, entry: Entry) -> Result<()>;

    /// Delete an entry.
    fn remove(&self, key: RingKey) -> Result<Option<Entry>>;

    /// Number of stored entries.
    fn len(&self) -> Result<usize>;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All entries whose key lies in `interval`, in ring order from the
    /// interval start.
    fn get_range(&self, interval: &Interval) -> Result<Vec<Entry>>;

    /// Number of entries in `interval`.
    fn count_range(&self, interval: &Interval) -> Result<usize>;

    /// Start recording writes and deletes within `interval`.
    fn arm_changes(&self, interval: &Interval) -> Result<()>;

    /// The changes recorded since [`Store::arm_changes`], restricted to
    /// `interval`.
    fn get_changes(&self, interval: &Interval) -> Result<Changes>;

    /// Apply one resolve with [`resolve_entry`] semantics. Idempotent on
    /// `(key, version)`.
    fn apply_resolve(&self, entry: Entry, kind: RepairKind) -> Result<ResolveOutcome>;

    /// Take or release the write lock, creating a transient empty entry if
    /// needed.
    fn set_write_lock(&self, key: RingKey, locked: bool) -> Result<()>;

    /// Stack one read lock, creating a transient empty entry if needed.
    fn add_read_lock(&self, key: RingKey) -> Result<()>;

    /// Release one read lock.
    fn release_read_lock(&self, key: RingKey) -> Result<()>;
}
