//! Version clock, transaction markers and the undo log.

use crate::record::Rid;
use lstore_common::Value;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point on the version clock returned by `begin`.
///
/// Versions written before the marker carry smaller timestamps, versions
/// written after it carry larger ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxMarker(pub u64);

impl TxMarker {
    /// Clock tick of the marker.
    pub fn tick(&self) -> u64 {
        self.0
    }
}

/// Monotonic logical clock shared by every table of a database.
#[derive(Debug, Default)]
pub struct VersionClock {
    now: AtomicU64,
    active: Mutex<BTreeSet<u64>>,
}

impl VersionClock {
    /// Creates a clock resuming after `last`.
    pub fn starting_at(last: u64) -> Self {
        Self {
            now: AtomicU64::new(last),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Advances the clock and returns the new tick.
    pub fn tick(&self) -> u64 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Most recently issued tick.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Opens a marker at a fresh tick.
    pub fn begin(&self) -> TxMarker {
        let mut active = self.active.lock();
        let tick = self.tick();
        active.insert(tick);
        TxMarker(tick)
    }

    /// Closes a marker. Returns false if it was not open.
    pub fn end(&self, marker: TxMarker) -> bool {
        self.active.lock().remove(&marker.0)
    }

    /// Oldest open marker.
    pub fn oldest_active(&self) -> Option<TxMarker> {
        self.active.lock().first().copied().map(TxMarker)
    }

    /// Returns true while any marker is open.
    pub fn has_active(&self) -> bool {
        !self.active.lock().is_empty()
    }

    /// Returns true if a write stamped `ts` happened after some open marker
    /// and must therefore be undoable.
    pub fn needs_undo(&self, ts: u64) -> bool {
        self.oldest_active().is_some_and(|m| m.0 < ts)
    }
}

/// One undoable mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// A record was inserted at `rid`.
    Insert { key: Value, rid: Rid },
    /// The record `old_key` at `prev` became `new_key` at `new`.
    Update {
        old_key: Value,
        new_key: Value,
        prev: Rid,
        new: Rid,
    },
    /// The record at `prev` was deleted.
    Delete { key: Value, prev: Rid },
}

/// An undo entry stamped with the tick of the write it reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub ts: u64,
    pub action: UndoAction,
}

/// Per-table log of mutations made while markers are open.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Mutex<Vec<UndoEntry>>,
}

impl UndoLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, ts: u64, action: UndoAction) {
        self.entries.lock().push(UndoEntry { ts, action });
    }

    /// Returns a copy of every entry newer than `marker`, newest first.
    pub fn since(&self, marker: TxMarker) -> Vec<UndoEntry> {
        let mut since: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.ts > marker.0)
            .cloned()
            .collect();
        // Concurrent writers may append slightly out of tick order.
        since.sort_by(|a, b| b.ts.cmp(&a.ts));
        since
    }

    /// Removes every entry newer than `marker`. Returns how many were removed.
    pub fn truncate_since(&self, marker: TxMarker) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.ts <= marker.0);
        before - entries.len()
    }

    /// Drops entries no open marker can roll back to.
    pub fn prune(&self, oldest_active: Option<TxMarker>) {
        let mut entries = self.entries.lock();
        match oldest_active {
            None => entries.clear(),
            Some(marker) => entries.retain(|e| e.ts > marker.0),
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
