//! In-memory replica store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::interval::Interval;
use crate::keys::RingKey;
use crate::store::{resolve_entry, Changes, Entry, RepairKind, ResolveOutcome};

/// Shared in-memory store backed by an ordered map.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u128, Entry>,
    recorder: Option<Recorder>,
}

#[derive(Debug)]
struct Recorder {
    interval: Interval,
    written: BTreeSet<u128>,
    deleted: BTreeSet<u128>,
}

impl Inner {
    fn record_write(&mut self, key: RingKey) {
        if let Some(rec) = &mut self.recorder {
            if rec.interval.contains(key) {
                rec.written.insert(key.value());
                rec.deleted.remove(&key.value());
            }
        }
    }

    fn record_delete(&mut self, key: RingKey) {
        if let Some(rec) = &mut self.recorder {
            if rec.interval.contains(key) {
                rec.deleted.insert(key.value());
                rec.written.remove(&key.value());
            }
        }
    }

    /// Keys in ring order starting at the interval start, using ordered-map
    /// range scans rather than a full filter pass.
    fn range_entries(&self, interval: &Interval) -> Vec<Entry> {
        match interval {
            Interval::Empty => Vec::new(),
            Interval::Full => self.entries.values().cloned().collect(),
            Interval::Arc { x, y } => {
                let (x, y) = (x.value(), y.value());
                if x < y {
                    self.entries.range(x..y).map(|(_, e)| e.clone()).collect()
                } else {
                    self.entries
                        .range(x..)
                        .chain(self.entries.range(..y))
                        .map(|(_, e)| e.clone())
                        .collect()
                }
            }
        }
    }

    fn with_entry<T>(
        &mut self,
        key: RingKey,
        f: impl FnOnce(&mut Entry) -> Result<T>,
    ) -> Result<T> {
        let entry = self
            .entries
            .entry(key.value())
            .or_insert_with(|| Entry::empty(key));
        let result = f(entry);
        // drop transient lock carriers once all locks are gone
        if entry.is_empty() && !entry.is_locked() && entry.version == 0 {
            self.entries.remove(&key.value());
        }
        result
    }
}

impl super::Store for MemStore {
    fn get(&self, key: RingKey) -> Result<Option<Entry>> {
        Ok(self.inner.read().entries.get(&key.value()).cloned())
    }

    fn put(&self, entry: Entry) -> Result<()> {
        let mut inner = self.inner.write();
        let key = entry.key;
        inner.entries.insert(key.value(), entry);
        inner.record_write(key);
        Ok(())
    }

    fn remove(&self, key: RingKey) -> Result<Option<Entry>> {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(&key.value());
        if removed.is_some() {
            inner.record_delete(key);
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.inner.read().entries.len())
    }

    fn get_range(&self, interval: &Interval) -> Result<Vec<Entry>> {
        Ok(self.inner.read().range_entries(interval))
    }

    fn count_range(&self, interval: &Interval) -> Result<usize> {
        Ok(self.inner.read().range_entries(interval).len())
    }

    fn arm_changes(&self, interval: &Interval) -> Result<()> {
        self.inner.write().recorder = Some(Recorder {
            interval: *interval,
            written: BTreeSet::new(),
            deleted: BTreeSet::new(),
        });
        Ok(())
    }

    fn get_changes(&self, interval: &Interval) -> Result<Changes> {
        let inner = self.inner.read();
        let mut changes = Changes::default();
        if let Some(rec) = &inner.recorder {
            for key in &rec.written {
                if interval.contains(RingKey::new(*key)) {
                    if let Some(entry) = inner.entries.get(key) {
                        changes.written.push(entry.clone());
                    }
                }
            }
            for key in &rec.deleted {
                if interval.contains(RingKey::new(*key)) {
                    changes.deleted.push(RingKey::new(*key));
                }
            }
        }
        Ok(changes)
    }

    fn apply_resolve(&self, entry: Entry, kind: RepairKind) -> Result<ResolveOutcome> {
        let mut inner = self.inner.write();
        let key = entry.key;
        let outcome = resolve_entry(inner.entries.get(&key.value()), &entry, kind);
        match outcome {
            ResolveOutcome::Regenerated => {
                inner.entries.insert(key.value(), entry);
                inner.record_write(key);
            }
            ResolveOutcome::Updated => {
                let local = inner
                    .entries
                    .get_mut(&key.value())
                    .expect("updated entry exists");
                local.value = entry.value;
                local.version = entry.version;
                inner.record_write(key);
            }
            ResolveOutcome::Unchanged | ResolveOutcome::Conflict | ResolveOutcome::Locked => {}
        }
        Ok(outcome)
    }

    fn set_write_lock(&self, key: RingKey, locked: bool) -> Result<()> {
        self.inner
            .write()
            .with_entry(key, |e| e.set_write_lock(locked).map_err(Into::into))
    }

    fn add_read_lock(&self, key: RingKey) -> Result<()> {
        self.inner
            .write()
            .with_entry(key, |e| e.acquire_read_lock().map_err(Into::into))
    }

    fn release_read_lock(&self, key: RingKey) -> Result<()> {
        self.inner
            .write()
            .with_entry(key, |e| e.release_read_lock().map_err(Into::into))
    }
}
