//! Tables: the record manager over page ranges, the buffer pool and indexes.

use crate::catalog::TableSnapshot;
use crate::index::{ColumnIndex, TableIndex};
use crate::merge::MergeScheduler;
use crate::range::{PageRange, RangeState, TableLayout, VersionMeta};
use crate::record::{
    column_mask, Record, Rid, VersionSpec, MAX_DATA_COLUMNS, MAX_RANGE_ID, TOMBSTONE_BIT,
};
use crate::txn::{TxMarker, UndoAction, UndoLog, VersionClock};
use lstore_buffer::BufferPool;
use lstore_common::page::PageKind;
use lstore_common::{ColumnType, LStoreError, Result, Value};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Number of striped key locks per table.
pub const LOCK_STRIPES: usize = 64;

/// Shared engine state every table of a database runs against.
#[derive(Clone)]
pub(crate) struct TableEnv {
    pub pool: Arc<BufferPool>,
    pub clock: Arc<VersionClock>,
    pub merge_tail_threshold: u32,
    pub merge_retry_limit: u32,
    /// Background merge worker; None merges inline after the triggering write.
    pub scheduler: Option<Arc<MergeScheduler>>,
    /// Merges hold the read side; checkpoints, new markers and table drops
    /// hold the write side.
    pub merge_fence: Arc<RwLock<()>>,
}

/// A table of typed columns keyed by one unique column.
pub struct Table {
    id: u32,
    name: String,
    key_column: usize,
    layout: Arc<TableLayout>,
    pub(crate) env: TableEnv,
    ranges: RwLock<Vec<Arc<PageRange>>>,
    pub(crate) index: TableIndex,
    stripes: Vec<Mutex<()>>,
    undo: UndoLog,
    dropped: AtomicBool,
    this: Weak<Table>,
}

impl Table {
    /// Creates an empty table after validating its schema.
    pub(crate) fn create(
        id: u32,
        name: String,
        column_types: Vec<ColumnType>,
        key_column: usize,
        base_pages_per_range: u32,
        env: TableEnv,
    ) -> Result<Arc<Self>> {
        if column_types.is_empty() || column_types.len() > MAX_DATA_COLUMNS {
            return Err(LStoreError::InvalidParameter {
                name: "columns".to_string(),
                value: column_types.len().to_string(),
            });
        }
        if key_column >= column_types.len() {
            return Err(LStoreError::ColumnOutOfRange {
                column: key_column,
                num_columns: column_types.len(),
            });
        }
        for (column, ty) in column_types.iter().enumerate() {
            ty.validate(column)?;
        }

        Ok(Self::build(
            id,
            name,
            column_types,
            key_column,
            base_pages_per_range,
            Vec::new(),
            env,
        ))
    }

    /// Rebuilds a table from its catalog entry.
    pub(crate) fn restore(snapshot: TableSnapshot, env: TableEnv) -> Result<Arc<Self>> {
        let table = Self::build(
            snapshot.id,
            snapshot.name,
            snapshot.columns,
            snapshot.key_column,
            snapshot.base_pages_per_range,
            snapshot.ranges,
            env,
        );

        for (key, rid) in snapshot.primary {
            table.index.primary().insert(key, rid)?;
        }
        for column in snapshot.indexed_columns {
            table.create_index(column)?;
        }

        debug!(
            table = %table.name,
            ranges = table.num_ranges(),
            records = table.len(),
            "restored table"
        );
        Ok(table)
    }

    fn build(
        id: u32,
        name: String,
        column_types: Vec<ColumnType>,
        key_column: usize,
        base_pages_per_range: u32,
        ranges: Vec<RangeState>,
        env: TableEnv,
    ) -> Arc<Self> {
        let layout = Arc::new(TableLayout::new(id, column_types, base_pages_per_range));
        let ranges = ranges
            .into_iter()
            .enumerate()
            .map(|(range_id, state)| {
                Arc::new(PageRange::with_state(
                    range_id as u32,
                    Arc::clone(&layout),
                    Arc::clone(&env.pool),
                    state,
                ))
            })
            .collect();

        Arc::new_cyclic(|this| Self {
            id,
            name,
            key_column,
            layout,
            env,
            ranges: RwLock::new(ranges),
            index: TableIndex::new(key_column),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            undo: UndoLog::new(),
            dropped: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Table identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the primary key column.
    pub fn key_column(&self) -> usize {
        self.key_column
    }

    /// Column types in column order.
    pub fn column_types(&self) -> &[ColumnType] {
        &self.layout.column_types
    }

    /// Number of data columns.
    pub fn num_columns(&self) -> usize {
        self.layout.num_columns()
    }

    /// Number of page ranges.
    pub fn num_ranges(&self) -> usize {
        self.ranges.read().len()
    }

    /// Number of visible records.
    pub fn len(&self) -> usize {
        self.index.primary().len()
    }

    /// Returns true if the table holds no visible record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Columns carrying a secondary index.
    pub fn indexed_columns(&self) -> Vec<usize> {
        self.index.indexed_columns()
    }

    /// Location of a key's latest version.
    pub fn locate(&self, key: &Value) -> Option<Rid> {
        self.index.get(key)
    }

    /// Cursors of one page range.
    pub fn range_state(&self, range_id: u32) -> Result<RangeState> {
        Ok(self.range(range_id)?.state())
    }

    pub(crate) fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub(crate) fn range(&self, range_id: u32) -> Result<Arc<PageRange>> {
        self.ranges
            .read()
            .get(range_id as usize)
            .cloned()
            .ok_or_else(|| {
                LStoreError::Internal(format!("table {} has no range {}", self.name, range_id))
            })
    }

    pub(crate) fn range_ids(&self) -> Vec<u32> {
        (0..self.num_ranges() as u32).collect()
    }

    // Locking

    fn stripe_of(key: &Value) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % LOCK_STRIPES as u64) as usize
    }

    /// Locks the stripe guarding `key`.
    pub(crate) fn lock_key(&self, key: &Value) -> MutexGuard<'_, ()> {
        self.stripes[Self::stripe_of(key)].lock()
    }

    /// Locks the stripes of two keys in stripe order.
    fn lock_keys(&self, key: &Value, other: Option<&Value>) -> Vec<MutexGuard<'_, ()>> {
        let first = Self::stripe_of(key);
        match other.map(Self::stripe_of) {
            Some(second) if second != first => {
                let (lo, hi) = (first.min(second), first.max(second));
                vec![self.stripes[lo].lock(), self.stripes[hi].lock()]
            }
            _ => vec![self.stripes[first].lock()],
        }
    }

    /// Locks every stripe, quiescing all writers of the table.
    fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes.iter().map(|stripe| stripe.lock()).collect()
    }

    /// Marks the table dropped and waits for its writers to finish.
    ///
    /// Writers check the mark under their stripe, so none runs while the
    /// returned guards are held.
    pub(crate) fn retire(&self) -> Vec<MutexGuard<'_, ()>> {
        self.dropped.store(true, Ordering::Release);
        self.lock_all()
    }

    /// Returns true once the table has been dropped from its database.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.is_dropped() {
            return Err(LStoreError::TableNotFound(self.name.clone()));
        }
        Ok(())
    }

    // Validation

    fn check_columns(&self, columns: &[usize]) -> Result<()> {
        let num_columns = self.num_columns();
        match columns.iter().find(|&&c| c >= num_columns) {
            Some(&column) => Err(LStoreError::ColumnOutOfRange {
                column,
                num_columns,
            }),
            None => Ok(()),
        }
    }

    fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.num_columns() {
            return Err(LStoreError::SchemaMismatch {
                expected: self.num_columns(),
                actual,
            });
        }
        Ok(())
    }

    fn check_int_column(&self, column: usize) -> Result<()> {
        self.check_columns(&[column])?;
        match self.layout.column_types[column] {
            ColumnType::Int => Ok(()),
            other => Err(LStoreError::TypeMismatch {
                column,
                expected: ColumnType::Int.name().to_string(),
                actual: other.name().to_string(),
            }),
        }
    }

    // Writes

    /// Inserts a record. Fails with `DuplicateKey` if the key is visible.
    pub fn insert(&self, values: Vec<Value>) -> Result<Rid> {
        self.check_len(values.len())?;
        for (column, value) in values.iter().enumerate() {
            value.check(self.layout.column_types[column], column)?;
        }

        let key = values[self.key_column].clone();
        let _stripe = self.lock_key(&key);
        self.check_live()?;
        if self.index.get(&key).is_some() {
            return Err(LStoreError::DuplicateKey);
        }

        let (range, rid) = self.allocate_base()?;
        let result = self.insert_at(&range, rid, key, &values);
        range.settle_base_slot();
        result.map(|()| rid)
    }

    fn insert_at(&self, range: &PageRange, rid: Rid, key: Value, values: &[Value]) -> Result<()> {
        let ts = self.env.clock.tick();
        let meta = VersionMeta {
            indirection: None,
            timestamp: ts,
            schema: self.full_mask(),
        };
        let columns: Vec<(usize, &Value)> = values.iter().enumerate().collect();
        range.write_version(rid, meta, &columns)?;

        self.index.primary().insert(key.clone(), rid)?;
        for (column, index) in self.index.secondaries() {
            index.insert(values[column].clone(), rid)?;
        }

        if self.env.clock.needs_undo(ts) {
            self.undo.push(ts, UndoAction::Insert { key, rid });
        }
        Ok(())
    }

    fn allocate_base(&self) -> Result<(Arc<PageRange>, Rid)> {
        loop {
            let active = self.ranges.read().last().cloned();
            if let Some(range) = active {
                if let Some(rid) = range.allocate_base_slot() {
                    return Ok((range, rid));
                }
            }

            let mut ranges = self.ranges.write();
            if ranges.last().is_some_and(|range| !range.is_sealed()) {
                continue;
            }
            let range_id = ranges.len() as u32;
            if range_id > MAX_RANGE_ID {
                return Err(LStoreError::Internal(format!(
                    "table {} ran out of page range ids",
                    self.name
                )));
            }
            ranges.push(Arc::new(PageRange::new(
                range_id,
                Arc::clone(&self.layout),
                Arc::clone(&self.env.pool),
            )));
            debug!(table = %self.name, range = range_id, "opened page range");
        }
    }

    /// Updates a record. `None` leaves a column unchanged.
    ///
    /// Setting the key column to another record's key fails with
    /// `DuplicateKey`; setting it to a free key moves the record.
    pub fn update(&self, key: &Value, values: Vec<Option<Value>>) -> Result<Rid> {
        self.check_len(values.len())?;
        for (column, value) in values.iter().enumerate() {
            if let Some(value) = value {
                value.check(self.layout.column_types[column], column)?;
            }
        }

        if values.iter().all(Option::is_none) {
            self.check_live()?;
            return self.index.get(key).ok_or(LStoreError::KeyNotFound);
        }

        let new_key = values[self.key_column].as_ref().filter(|&k| k != key);
        let rid = {
            let _stripes = self.lock_keys(key, new_key);
            self.update_locked(key, &values)?
        };
        self.maybe_merge(rid.range_id);
        Ok(rid)
    }

    /// Writes a tail version. The caller holds the stripes of the old and
    /// new key.
    fn update_locked(&self, key: &Value, values: &[Option<Value>]) -> Result<Rid> {
        self.check_live()?;
        let prev = self.index.get(key).ok_or(LStoreError::KeyNotFound)?;
        let new_key = values[self.key_column].as_ref().filter(|&k| k != key);
        if let Some(new_key) = new_key {
            if self.index.get(new_key).is_some() {
                return Err(LStoreError::DuplicateKey);
            }
        }

        let range = self.range(prev.range_id)?;
        let secondaries = self.index.secondaries();
        let indexed: Vec<usize> = secondaries.iter().map(|(column, _)| *column).collect();
        let old_indexed = self.resolve(&range, prev, &indexed, VersionSpec::Latest)?;

        let changed: Vec<(usize, &Value)> = values
            .iter()
            .enumerate()
            .filter_map(|(column, value)| value.as_ref().map(|v| (column, v)))
            .collect();
        let ts = self.env.clock.tick();
        let tail = range.allocate_tail_slot()?;
        let meta = VersionMeta {
            indirection: Some(prev),
            timestamp: ts,
            schema: column_mask(changed.iter().map(|(column, _)| *column)),
        };
        range.write_version(tail, meta, &changed)?;

        match new_key {
            None => {
                self.index.repoint(key, tail)?;
            }
            Some(new_key) => {
                self.index.remove_key(key);
                self.index.primary().insert(new_key.clone(), tail)?;
            }
        }
        for ((column, index), old) in secondaries.iter().zip(old_indexed) {
            index.remove(&old, prev);
            let new = values[*column].clone().unwrap_or(old);
            index.insert(new, tail)?;
        }

        if self.env.clock.needs_undo(ts) {
            self.undo.push(
                ts,
                UndoAction::Update {
                    old_key: key.clone(),
                    new_key: new_key.unwrap_or(key).clone(),
                    prev,
                    new: tail,
                },
            );
        }
        Ok(tail)
    }

    /// Deletes a record by appending a tombstone and dropping its index
    /// entries. The key can be inserted again afterwards.
    pub fn delete(&self, key: &Value) -> Result<()> {
        let range_id = {
            let _stripe = self.lock_key(key);
            self.check_live()?;
            let prev = self.index.get(key).ok_or(LStoreError::KeyNotFound)?;
            let range = self.range(prev.range_id)?;
            let secondaries = self.index.secondaries();
            let indexed: Vec<usize> = secondaries.iter().map(|(column, _)| *column).collect();
            let old_indexed = self.resolve(&range, prev, &indexed, VersionSpec::Latest)?;

            let ts = self.env.clock.tick();
            let tail = range.allocate_tail_slot()?;
            let meta = VersionMeta {
                indirection: Some(prev),
                timestamp: ts,
                schema: TOMBSTONE_BIT,
            };
            range.write_version(tail, meta, &[])?;

            self.index.remove_key(key);
            for ((_, index), old) in secondaries.iter().zip(old_indexed) {
                index.remove(&old, prev);
            }

            if self.env.clock.needs_undo(ts) {
                self.undo.push(
                    ts,
                    UndoAction::Delete {
                        key: key.clone(),
                        prev,
                    },
                );
            }
            prev.range_id
        };
        self.maybe_merge(range_id);
        Ok(())
    }

    /// Adds one to an integer column and returns the new value.
    pub fn increment(&self, key: &Value, column: usize) -> Result<i64> {
        self.check_int_column(column)?;

        let bump = |value: &Value| -> Result<i64> {
            value
                .as_int()
                .and_then(|n| n.checked_add(1))
                .ok_or_else(|| LStoreError::InvalidParameter {
                    name: "increment".to_string(),
                    value: value.to_string(),
                })
        };

        let moves_key = column == self.key_column;
        let new_key = if moves_key {
            Some(Value::Int(bump(key)?))
        } else {
            None
        };

        let (next, rid) = {
            let _stripes = self.lock_keys(key, new_key.as_ref());
            self.check_live()?;
            let next = match &new_key {
                Some(Value::Int(n)) => *n,
                _ => {
                    let rid = self.index.get(key).ok_or(LStoreError::KeyNotFound)?;
                    let range = self.range(rid.range_id)?;
                    let current = self.resolve(&range, rid, &[column], VersionSpec::Latest)?;
                    bump(&current[0])?
                }
            };

            let mut values = vec![None; self.num_columns()];
            values[column] = Some(Value::Int(next));
            (next, self.update_locked(key, &values)?)
        };
        self.maybe_merge(rid.range_id);
        Ok(next)
    }

    fn full_mask(&self) -> u64 {
        column_mask(0..self.num_columns())
    }

    // Reads

    /// Reads the requested columns of one record.
    pub fn select(&self, key: &Value, columns: &[usize], spec: VersionSpec) -> Result<Record> {
        self.check_live()?;
        self.check_columns(columns)?;
        loop {
            let rid = self.index.get(key).ok_or(LStoreError::KeyNotFound)?;
            let range = self.range(rid.range_id)?;
            let _gate = range.read_gate();
            // A merge may have repointed the key before the gate was taken.
            if self.index.get(key) != Some(rid) {
                continue;
            }

            let values = self.resolve(&range, rid, columns, spec)?;
            return Ok(Record {
                rid,
                key: key.clone(),
                values,
            });
        }
    }

    /// Reads every record whose key lies in `[lo, hi]`, in key order.
    pub fn select_range(
        &self,
        lo: &Value,
        hi: &Value,
        columns: &[usize],
        spec: VersionSpec,
    ) -> Result<Vec<Record>> {
        self.check_live()?;
        self.check_columns(columns)?;
        let mut records = Vec::new();
        for (key, _) in self.index.primary().locate_range(lo, hi) {
            match self.select(&key, columns, spec) {
                Ok(record) => records.push(record),
                Err(LStoreError::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Reads every record whose latest value in `column` equals `value`.
    ///
    /// Non-key columns need a secondary index. The index matches latest
    /// values; `spec` selects which version of each match is returned.
    pub fn select_by(
        &self,
        column: usize,
        value: &Value,
        columns: &[usize],
        spec: VersionSpec,
    ) -> Result<Vec<Record>> {
        self.check_live()?;
        self.check_columns(&[column])?;
        self.check_columns(columns)?;

        if column == self.key_column {
            return match self.select(value, columns, spec) {
                Ok(record) => Ok(vec![record]),
                Err(LStoreError::KeyNotFound) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let index = self
            .index
            .secondary(column)
            .ok_or(LStoreError::IndexNotFound(column))?;

        let mut keys = BTreeSet::new();
        for rid in index.locate(value) {
            let range = self.range(rid.range_id)?;
            let _gate = range.read_gate();
            if !index.contains(value, rid) {
                continue;
            }
            let mut key = self.resolve(&range, rid, &[self.key_column], VersionSpec::Latest)?;
            keys.extend(key.pop());
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.select(&key, columns, spec) {
                Ok(record) => records.push(record),
                Err(LStoreError::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Sums an integer column over the keys in `[lo, hi]`. Zero if none.
    pub fn sum(&self, lo: &Value, hi: &Value, column: usize, spec: VersionSpec) -> Result<i64> {
        self.check_int_column(column)?;
        let records = self.select_range(lo, hi, &[column], spec)?;
        Ok(records
            .iter()
            .filter_map(|record| record.values[0].as_int())
            .fold(0i64, i64::wrapping_add))
    }

    /// Resolves the version `spec` selects, starting from the latest
    /// version at `rid`, and collects `columns` from it and its
    /// predecessors.
    ///
    /// Callers hold either the range's read gate or the key's stripe.
    pub(crate) fn resolve(
        &self,
        range: &PageRange,
        rid: Rid,
        columns: &[usize],
        spec: VersionSpec,
    ) -> Result<Vec<Value>> {
        let mut current = rid;
        let mut meta = range.read_meta(current)?;

        match spec {
            VersionSpec::Latest => {}
            VersionSpec::Relative(steps) => {
                for _ in 0..steps {
                    let Some(prev) = meta.indirection else {
                        break;
                    };
                    current = prev;
                    meta = range.read_meta(current)?;
                }
            }
            VersionSpec::AsOf(marker) => {
                while meta.timestamp >= marker.tick() {
                    match meta.indirection {
                        Some(prev) => {
                            current = prev;
                            meta = range.read_meta(current)?;
                        }
                        // Inserted after the marker.
                        None if self.is_insertion_slot(current) => {
                            return Err(LStoreError::KeyNotFound)
                        }
                        // History before a merge is folded into its base.
                        None => break,
                    }
                }
            }
        }

        if meta.schema & TOMBSTONE_BIT != 0 {
            return Err(LStoreError::KeyNotFound);
        }

        let mut found: Vec<Option<Value>> = vec![None; columns.len()];
        let mut missing = columns.len();
        loop {
            for (slot, &column) in columns.iter().enumerate() {
                if found[slot].is_none() && meta.schema & (1u64 << column) != 0 {
                    found[slot] = Some(range.read_value(current, column)?);
                    missing -= 1;
                }
            }
            if missing == 0 {
                break;
            }
            match meta.indirection {
                Some(prev) => {
                    current = prev;
                    meta = range.read_meta(current)?;
                }
                None => {
                    return Err(LStoreError::Internal(format!(
                        "version chain of {} ends before every column is found",
                        rid
                    )))
                }
            }
        }

        Ok(found.into_iter().flatten().collect())
    }

    /// Latest full row of a record, with the timestamp of its latest version.
    pub(crate) fn resolve_row(&self, range: &PageRange, rid: Rid) -> Result<(u64, Vec<Value>)> {
        let timestamp = range.read_meta(rid)?.timestamp;
        let columns: Vec<usize> = (0..self.num_columns()).collect();
        let row = self.resolve(range, rid, &columns, VersionSpec::Latest)?;
        Ok((timestamp, row))
    }

    fn is_insertion_slot(&self, rid: Rid) -> bool {
        rid.kind == PageKind::Base && rid.slot < self.layout.base_capacity()
    }

    // Secondary indexes

    /// Builds a secondary index over the visible records. Writers are
    /// paused while it is built.
    pub fn create_index(&self, column: usize) -> Result<()> {
        self.check_columns(&[column])?;
        if column == self.key_column || self.index.secondary(column).is_some() {
            return Err(LStoreError::InvalidParameter {
                name: "index column".to_string(),
                value: column.to_string(),
            });
        }

        let _stripes = self.lock_all();
        self.check_live()?;
        let index = ColumnIndex::non_unique();
        for (_, rid) in self.index.primary().entries() {
            let range = self.range(rid.range_id)?;
            let mut value = self.resolve(&range, rid, &[column], VersionSpec::Latest)?;
            if let Some(value) = value.pop() {
                index.insert(value, rid)?;
            }
        }

        let entries = index.len();
        self.index.add_secondary(column, index)?;
        info!(table = %self.name, column, entries, "created secondary index");
        Ok(())
    }

    /// Drops a secondary index. The primary index cannot be dropped.
    pub fn drop_index(&self, column: usize) -> Result<()> {
        let _stripes = self.lock_all();
        self.check_live()?;
        self.index.drop_secondary(column)?;
        info!(table = %self.name, column, "dropped secondary index");
        Ok(())
    }

    // Transactions

    /// Reverts every logged mutation newer than `marker`, newest first.
    ///
    /// Every version is read before any index changes, so a failed read
    /// leaves the table and its undo log untouched. Returns the number of
    /// mutations reverted.
    pub(crate) fn rollback_since(&self, marker: TxMarker) -> Result<usize> {
        let _stripes = self.lock_all();
        let entries = self.undo.since(marker);
        let secondaries = self.index.secondaries();
        let columns: Vec<usize> = secondaries.iter().map(|(column, _)| *column).collect();

        let mut planned = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (prev_values, new_values) = match &entry.action {
                UndoAction::Insert { rid, .. } => {
                    (Vec::new(), self.indexed_values(*rid, &columns)?)
                }
                UndoAction::Update { prev, new, .. } => (
                    self.indexed_values(*prev, &columns)?,
                    self.indexed_values(*new, &columns)?,
                ),
                UndoAction::Delete { prev, .. } => {
                    (self.indexed_values(*prev, &columns)?, Vec::new())
                }
            };
            planned.push((&entry.action, prev_values, new_values));
        }

        let reverted = self.undo.truncate_since(marker);
        for (action, prev_values, new_values) in planned {
            self.revert(action, &secondaries, prev_values, new_values)?;
        }

        if reverted > 0 {
            info!(table = %self.name, reverted, "rolled back mutations");
        }
        Ok(reverted)
    }

    /// Applies one undo entry to the indexes. `prev_values` and
    /// `new_values` hold the secondary-indexed columns of the version before
    /// and after the mutation.
    fn revert(
        &self,
        action: &UndoAction,
        secondaries: &[(usize, Arc<ColumnIndex>)],
        prev_values: Vec<Value>,
        new_values: Vec<Value>,
    ) -> Result<()> {
        let primary = self.index.primary();
        match action {
            UndoAction::Insert { key, rid } => {
                if !primary.remove(key, *rid) {
                    return Err(self.undo_mismatch(key, *rid));
                }
                for ((_, index), value) in secondaries.iter().zip(new_values) {
                    index.remove(&value, *rid);
                }
            }
            UndoAction::Update {
                old_key,
                new_key,
                prev,
                new,
            } => {
                if old_key == new_key {
                    if !primary.compare_and_repoint(old_key, *new, *prev) {
                        return Err(self.undo_mismatch(old_key, *new));
                    }
                } else {
                    if !primary.remove(new_key, *new) {
                        return Err(self.undo_mismatch(new_key, *new));
                    }
                    primary.insert(old_key.clone(), *prev)?;
                }
                for (((_, index), new_value), prev_value) in
                    secondaries.iter().zip(new_values).zip(prev_values)
                {
                    index.remove(&new_value, *new);
                    index.insert(prev_value, *prev)?;
                }
            }
            UndoAction::Delete { key, prev } => {
                primary.insert(key.clone(), *prev)?;
                for ((_, index), value) in secondaries.iter().zip(prev_values) {
                    index.insert(value, *prev)?;
                }
            }
        }
        Ok(())
    }

    fn undo_mismatch(&self, key: &Value, rid: Rid) -> LStoreError {
        LStoreError::Internal(format!(
            "undo log of table {} expected key {} at {}",
            self.name, key, rid
        ))
    }

    fn indexed_values(&self, rid: Rid, columns: &[usize]) -> Result<Vec<Value>> {
        let range = self.range(rid.range_id)?;
        self.resolve(&range, rid, columns, VersionSpec::Latest)
    }

    /// Drops undo entries no open marker can roll back to.
    pub(crate) fn prune_undo(&self, oldest_active: Option<TxMarker>) {
        self.undo.prune(oldest_active);
    }

    // Merge triggering

    fn maybe_merge(&self, range_id: u32) {
        let Ok(range) = self.range(range_id) else {
            return;
        };
        if range.tail_pages_since_watermark() < self.env.merge_tail_threshold {
            return;
        }

        match &self.env.scheduler {
            Some(scheduler) => {
                scheduler.schedule(self.this.clone(), self.id, range_id);
            }
            None => {
                if let Err(e) = self.merge_range(range_id) {
                    warn!(table = %self.name, range = range_id, error = %e, "inline merge failed");
                }
            }
        }
    }

    // Catalog

    /// Captures the persistent state of the table.
    pub(crate) fn snapshot(&self) -> TableSnapshot {
        // Index entries first, so every cursor captured afterwards covers
        // the slots they point at.
        let primary = self.index.primary().entries();
        let ranges = self.ranges.read().iter().map(|range| range.state()).collect();

        TableSnapshot {
            id: self.id,
            name: self.name.clone(),
            columns: self.layout.column_types.clone(),
            key_column: self.key_column,
            base_pages_per_range: self.layout.base_pages_per_range,
            ranges,
            primary,
            indexed_columns: self.index.indexed_columns(),
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("columns", &self.layout.column_types)
            .field("key_column", &self.key_column)
            .field("ranges", &self.num_ranges())
            .finish()
    }
}
