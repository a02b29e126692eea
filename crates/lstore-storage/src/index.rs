//! Ordered key indexes mapping column values to record locations.

use crate::record::Rid;
use lstore_common::{LStoreError, Result, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// An ordered index over one column.
///
/// Entries always point at the latest version of a record.
#[derive(Debug)]
pub enum ColumnIndex {
    /// One location per value (the primary key).
    Unique(RwLock<BTreeMap<Value, Rid>>),
    /// Any number of locations per value.
    NonUnique(RwLock<BTreeMap<Value, BTreeSet<Rid>>>),
}

impl ColumnIndex {
    /// Creates an empty unique index.
    pub fn unique() -> Self {
        ColumnIndex::Unique(RwLock::new(BTreeMap::new()))
    }

    /// Creates an empty non-unique index.
    pub fn non_unique() -> Self {
        ColumnIndex::NonUnique(RwLock::new(BTreeMap::new()))
    }

    /// Adds an entry. A unique index refuses a value it already holds.
    pub fn insert(&self, value: Value, rid: Rid) -> Result<()> {
        match self {
            ColumnIndex::Unique(map) => {
                let mut map = map.write();
                if map.contains_key(&value) {
                    return Err(LStoreError::DuplicateKey);
                }
                map.insert(value, rid);
            }
            ColumnIndex::NonUnique(map) => {
                map.write().entry(value).or_default().insert(rid);
            }
        }
        Ok(())
    }

    /// Removes the entry (value, rid). Returns false if it was absent.
    pub fn remove(&self, value: &Value, rid: Rid) -> bool {
        match self {
            ColumnIndex::Unique(map) => {
                let mut map = map.write();
                if map.get(value) == Some(&rid) {
                    map.remove(value);
                    true
                } else {
                    false
                }
            }
            ColumnIndex::NonUnique(map) => {
                let mut map = map.write();
                let Some(rids) = map.get_mut(value) else {
                    return false;
                };
                let removed = rids.remove(&rid);
                if rids.is_empty() {
                    map.remove(value);
                }
                removed
            }
        }
    }

    /// Replaces `expected` with `new` under `value` if `expected` is still
    /// present. Returns false otherwise.
    pub fn compare_and_repoint(&self, value: &Value, expected: Rid, new: Rid) -> bool {
        match self {
            ColumnIndex::Unique(map) => match map.write().get_mut(value) {
                Some(rid) if *rid == expected => {
                    *rid = new;
                    true
                }
                _ => false,
            },
            ColumnIndex::NonUnique(map) => {
                let mut map = map.write();
                let Some(rids) = map.get_mut(value) else {
                    return false;
                };
                if !rids.remove(&expected) {
                    return false;
                }
                rids.insert(new);
                true
            }
        }
    }

    /// Returns the locations stored under `value`.
    pub fn locate(&self, value: &Value) -> Vec<Rid> {
        match self {
            ColumnIndex::Unique(map) => map.read().get(value).copied().into_iter().collect(),
            ColumnIndex::NonUnique(map) => map
                .read()
                .get(value)
                .map(|rids| rids.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    /// Returns true if (value, rid) is an entry.
    pub fn contains(&self, value: &Value, rid: Rid) -> bool {
        match self {
            ColumnIndex::Unique(map) => map.read().get(value) == Some(&rid),
            ColumnIndex::NonUnique(map) => map
                .read()
                .get(value)
                .is_some_and(|rids| rids.contains(&rid)),
        }
    }

    /// Returns every entry with `lo <= value <= hi`, in ascending value order.
    pub fn locate_range(&self, lo: &Value, hi: &Value) -> Vec<(Value, Rid)> {
        if lo > hi {
            return Vec::new();
        }
        let bounds = (Bound::Included(lo), Bound::Included(hi));
        match self {
            ColumnIndex::Unique(map) => map
                .read()
                .range::<Value, _>(bounds)
                .map(|(v, rid)| (v.clone(), *rid))
                .collect(),
            ColumnIndex::NonUnique(map) => map
                .read()
                .range::<Value, _>(bounds)
                .flat_map(|(v, rids)| rids.iter().map(move |rid| (v.clone(), *rid)))
                .collect(),
        }
    }

    /// Returns every entry whose location lies in page range `range_id`.
    pub fn entries_in_range(&self, range_id: u32) -> Vec<(Value, Rid)> {
        self.entries()
            .into_iter()
            .filter(|(_, rid)| rid.range_id == range_id)
            .collect()
    }

    /// Returns every entry in ascending value order.
    pub fn entries(&self) -> Vec<(Value, Rid)> {
        match self {
            ColumnIndex::Unique(map) => map.read().iter().map(|(v, rid)| (v.clone(), *rid)).collect(),
            ColumnIndex::NonUnique(map) => map
                .read()
                .iter()
                .flat_map(|(v, rids)| rids.iter().map(move |rid| (v.clone(), *rid)))
                .collect(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            ColumnIndex::Unique(map) => map.read().len(),
            ColumnIndex::NonUnique(map) => map.read().values().map(BTreeSet::len).sum(),
        }
    }

    /// Returns true if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The primary index of a table plus its secondary indexes.
#[derive(Debug)]
pub struct TableIndex {
    key_column: usize,
    primary: ColumnIndex,
    secondaries: RwLock<HashMap<usize, Arc<ColumnIndex>>>,
}

impl TableIndex {
    /// Creates an index set with an empty primary index on `key_column`.
    pub fn new(key_column: usize) -> Self {
        Self {
            key_column,
            primary: ColumnIndex::unique(),
            secondaries: RwLock::new(HashMap::new()),
        }
    }

    /// Column backing the primary index.
    pub fn key_column(&self) -> usize {
        self.key_column
    }

    /// The primary index.
    pub fn primary(&self) -> &ColumnIndex {
        &self.primary
    }

    /// Latest location of `key`.
    pub fn get(&self, key: &Value) -> Option<Rid> {
        match &self.primary {
            ColumnIndex::Unique(map) => map.read().get(key).copied(),
            ColumnIndex::NonUnique(_) => self.primary.locate(key).first().copied(),
        }
    }

    /// Points an existing key at a new location. Returns the old location.
    pub fn repoint(&self, key: &Value, new: Rid) -> Result<Rid> {
        match &self.primary {
            ColumnIndex::Unique(map) => {
                let mut map = map.write();
                let rid = map.get_mut(key).ok_or(LStoreError::KeyNotFound)?;
                Ok(std::mem::replace(rid, new))
            }
            ColumnIndex::NonUnique(_) => Err(LStoreError::Internal(
                "primary index must be unique".to_string(),
            )),
        }
    }

    /// Removes a key regardless of its location.
    pub fn remove_key(&self, key: &Value) -> Option<Rid> {
        match &self.primary {
            ColumnIndex::Unique(map) => map.write().remove(key),
            ColumnIndex::NonUnique(_) => None,
        }
    }

    /// Installs a secondary index. Fails if `column` is already indexed.
    pub fn add_secondary(&self, column: usize, index: ColumnIndex) -> Result<()> {
        if column == self.key_column {
            return Err(LStoreError::InvalidParameter {
                name: "index column".to_string(),
                value: format!("{} is the primary key", column),
            });
        }
        let mut secondaries = self.secondaries.write();
        if secondaries.contains_key(&column) {
            return Err(LStoreError::InvalidParameter {
                name: "index column".to_string(),
                value: format!("{} is already indexed", column),
            });
        }
        secondaries.insert(column, Arc::new(index));
        Ok(())
    }

    /// Removes a secondary index. The primary index cannot be dropped.
    pub fn drop_secondary(&self, column: usize) -> Result<()> {
        if column == self.key_column {
            return Err(LStoreError::InvalidParameter {
                name: "drop_index".to_string(),
                value: format!("column {} holds the primary index", column),
            });
        }
        self.secondaries
            .write()
            .remove(&column)
            .map(|_| ())
            .ok_or(LStoreError::IndexNotFound(column))
    }

    /// Secondary index on `column`, if any.
    pub fn secondary(&self, column: usize) -> Option<Arc<ColumnIndex>> {
        self.secondaries.read().get(&column).cloned()
    }

    /// Every secondary index, ordered by column.
    pub fn secondaries(&self) -> Vec<(usize, Arc<ColumnIndex>)> {
        let mut all: Vec<_> = self
            .secondaries
            .read()
            .iter()
            .map(|(&c, idx)| (c, Arc::clone(idx)))
            .collect();
        all.sort_by_key(|(c, _)| *c);
        all
    }

    /// Columns carrying a secondary index, ascending.
    pub fn indexed_columns(&self) -> Vec<usize> {
        self.secondaries().into_iter().map(|(c, _)| c).collect()
    }
}
