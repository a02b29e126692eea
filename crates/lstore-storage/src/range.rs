//! Page ranges: groups of base pages plus an append-only tail.

use crate::column_page::ColumnPage;
use crate::record::{
    Rid, INDIRECTION_COLUMN, METADATA_COLUMNS, RID_COLUMN, SCHEMA_ENCODING_COLUMN,
    TIMESTAMP_COLUMN,
};
use lstore_buffer::BufferPool;
use lstore_common::page::{PageHeader, PageId, PageKind};
use lstore_common::{ColumnType, LStoreError, Result, Value};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Physical geometry shared by every range of a table.
#[derive(Debug, Clone)]
pub struct TableLayout {
    /// Owning table.
    pub table_id: u32,
    /// Types of the data columns.
    pub column_types: Vec<ColumnType>,
    /// Slots per page, identical for every column.
    pub slots_per_page: u32,
    /// Base pages per column in one range generation.
    pub base_pages_per_range: u32,
}

impl TableLayout {
    /// Computes the layout of a table.
    ///
    /// Slots per page is the smallest page capacity over all columns, so a
    /// slot number maps to the same (page, offset) in every column.
    pub fn new(table_id: u32, column_types: Vec<ColumnType>, base_pages_per_range: u32) -> Self {
        let slots_per_page = column_types
            .iter()
            .map(ColumnType::slot_width)
            .chain(std::iter::once(8))
            .map(PageHeader::slots_for_width)
            .min()
            .unwrap_or(0)
            .min(u16::MAX as usize) as u32;

        Self {
            table_id,
            column_types,
            slots_per_page,
            base_pages_per_range,
        }
    }

    /// Number of data columns.
    pub fn num_columns(&self) -> usize {
        self.column_types.len()
    }

    /// Number of slots in one base generation.
    pub fn base_capacity(&self) -> u32 {
        self.base_pages_per_range * self.slots_per_page
    }

    /// Slot width of a physical column.
    pub fn slot_width(&self, column: u16) -> usize {
        match (column as usize).checked_sub(METADATA_COLUMNS) {
            None => 8,
            Some(data) => self.column_types[data].slot_width(),
        }
    }

    /// Page holding `rid` in a physical column.
    pub fn page_id(&self, rid: Rid, column: u16) -> PageId {
        PageId::new(
            self.table_id,
            rid.range_id,
            rid.kind,
            column,
            rid.page_num(self.slots_per_page),
        )
    }

    /// Physical column of a data column.
    #[inline]
    pub fn physical(data_column: usize) -> u16 {
        (METADATA_COLUMNS + data_column) as u16
    }
}

/// Metadata of one record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMeta {
    /// Previous version, if any.
    pub indirection: Option<Rid>,
    /// Clock tick of the write.
    pub timestamp: u64,
    /// Data-column bitmask, plus the tombstone bit.
    pub schema: u64,
}

/// Allocation and merge cursors of a range. Persisted in the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeState {
    /// Next free insertion slot (generation 0).
    pub next_base: u32,
    /// Insertion slots whose insert has finished, successfully or not.
    #[serde(default)]
    pub settled_base: u32,
    /// Next free tail slot.
    pub next_tail: u32,
    /// Generation installed by the last successful merge (0 = none).
    pub generation: u32,
    /// Generation the next merge attempt writes.
    pub next_generation: u32,
    /// Tail slot below which every tail version is folded.
    pub watermark: u32,
    /// Merged generations below this one have been reclaimed.
    pub reclaim_from_generation: u32,
    /// Tail pages below this one have been reclaimed.
    pub reclaimed_tail_pages: u32,
    /// Whether generation 0 has been reclaimed.
    pub base_reclaimed: bool,
}

impl RangeState {
    fn fresh() -> Self {
        Self {
            next_generation: 1,
            reclaim_from_generation: 1,
            ..Default::default()
        }
    }
}

/// A merge attempt's view of the range, captured before it snapshots keys.
#[derive(Debug, Clone, Copy)]
pub struct MergeTicket {
    /// Generation the attempt writes.
    pub generation: u32,
    /// Tail cursor at capture time.
    pub watermark: u32,
    /// Whether generation 0 was full at capture time.
    pub sealed: bool,
}

/// A page range.
///
/// Holds `base_pages_per_range` base pages per column for insertions, an
/// unbounded append-only tail, and any generations written by merges.
pub struct PageRange {
    range_id: u32,
    layout: Arc<TableLayout>,
    pool: Arc<BufferPool>,
    state: Mutex<RangeState>,
    /// Serializes merges of this range.
    merge_lock: Mutex<()>,
    /// Readers resolve chains under the read side; reclamation takes the
    /// write side.
    gate: RwLock<()>,
    /// Superseded pages that were pinned when last reclaimed.
    pending_reclaim: Mutex<Vec<PageId>>,
}

impl PageRange {
    /// Creates an empty range.
    pub fn new(range_id: u32, layout: Arc<TableLayout>, pool: Arc<BufferPool>) -> Self {
        Self::with_state(range_id, layout, pool, RangeState::fresh())
    }

    /// Restores a range from persisted cursors.
    pub fn with_state(
        range_id: u32,
        layout: Arc<TableLayout>,
        pool: Arc<BufferPool>,
        mut state: RangeState,
    ) -> Self {
        state.settled_base = state.next_base;
        Self {
            range_id,
            layout,
            pool,
            state: Mutex::new(state),
            merge_lock: Mutex::new(()),
            gate: RwLock::new(()),
            pending_reclaim: Mutex::new(Vec::new()),
        }
    }

    /// Range identifier.
    pub fn range_id(&self) -> u32 {
        self.range_id
    }

    /// Copy of the current cursors.
    pub fn state(&self) -> RangeState {
        *self.state.lock()
    }

    /// Next insertion slot, or None when generation 0 is full.
    pub fn allocate_base_slot(&self) -> Option<Rid> {
        let mut state = self.state.lock();
        if state.next_base >= self.layout.base_capacity() {
            return None;
        }
        let slot = state.next_base;
        state.next_base += 1;
        Some(Rid::base(self.range_id, slot))
    }

    /// Marks an insertion slot's insert as finished.
    pub fn settle_base_slot(&self) {
        self.state.lock().settled_base += 1;
    }

    /// Appends a tail slot. Crossing a page boundary starts a new tail page.
    pub fn allocate_tail_slot(&self) -> Result<Rid> {
        let mut state = self.state.lock();
        let slot = state.next_tail;
        state.next_tail = slot.checked_add(1).ok_or_else(|| {
            LStoreError::Internal(format!("tail of range {} exhausted", self.range_id))
        })?;
        Ok(Rid::tail(self.range_id, slot))
    }

    /// Returns true once every insertion slot has been handed out.
    pub fn is_sealed(&self) -> bool {
        self.state.lock().next_base >= self.layout.base_capacity()
    }

    /// Tail pages' worth of versions appended since the merge watermark.
    pub fn tail_pages_since_watermark(&self) -> u32 {
        let state = self.state.lock();
        (state.next_tail - state.watermark).div_ceil(self.layout.slots_per_page)
    }

    /// Shared side of the reclaim gate.
    pub fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    /// Takes the merge lock unless another merge holds it.
    pub fn try_merge_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.merge_lock.try_lock()
    }

    /// Reads a metadata column as a raw u64.
    pub fn read_u64(&self, rid: Rid, column: u16) -> Result<u64> {
        let page_id = self.layout.page_id(rid, column);
        let guard = self.pool.read_page(page_id)?;
        let data = guard.data();
        let slot = ColumnPage::read_slot(&data[..], rid.offset(self.layout.slots_per_page))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slot);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a data column.
    pub fn read_value(&self, rid: Rid, data_column: usize) -> Result<Value> {
        let column = TableLayout::physical(data_column);
        let page_id = self.layout.page_id(rid, column);
        let guard = self.pool.read_page(page_id)?;
        let data = guard.data();
        let slot = ColumnPage::read_slot(&data[..], rid.offset(self.layout.slots_per_page))?;
        Value::decode(self.layout.column_types[data_column], page_id, slot)
    }

    /// Reads the metadata of a version.
    pub fn read_meta(&self, rid: Rid) -> Result<VersionMeta> {
        Ok(VersionMeta {
            indirection: Rid::unpack(self.read_u64(rid, INDIRECTION_COLUMN)?),
            timestamp: self.read_u64(rid, TIMESTAMP_COLUMN)?,
            schema: self.read_u64(rid, SCHEMA_ENCODING_COLUMN)?,
        })
    }

    fn write_slot(&self, rid: Rid, column: u16, bytes: &[u8]) -> Result<()> {
        let page_id = self.layout.page_id(rid, column);
        let width = self.layout.slot_width(column);
        let capacity = self.layout.slots_per_page as usize;

        let guard = self.pool.write_page_or_create(page_id, |buf: &mut [u8]| {
            ColumnPage::init(buf, page_id, width, capacity)
        })?;
        let mut data = guard.data_mut();
        ColumnPage::write_slot(&mut data[..], rid.offset(self.layout.slots_per_page), bytes)
    }

    /// Writes one record version: metadata plus the given data columns.
    ///
    /// Values are encoded before any page is touched, so a type error leaves
    /// the slot unwritten.
    pub fn write_version(
        &self,
        rid: Rid,
        meta: VersionMeta,
        values: &[(usize, &Value)],
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(values.len());
        for &(column, value) in values {
            let ty = self.layout.column_types[column];
            let mut buf = vec![0u8; ty.slot_width()];
            value.encode(ty, column, &mut buf)?;
            encoded.push((TableLayout::physical(column), buf));
        }

        let indirection = meta.indirection.map_or(Rid::NONE, |r| r.pack());
        self.write_slot(rid, INDIRECTION_COLUMN, &indirection.to_le_bytes())?;
        self.write_slot(rid, RID_COLUMN, &rid.pack().to_le_bytes())?;
        self.write_slot(rid, TIMESTAMP_COLUMN, &meta.timestamp.to_le_bytes())?;
        self.write_slot(rid, SCHEMA_ENCODING_COLUMN, &meta.schema.to_le_bytes())?;
        for (column, buf) in encoded {
            self.write_slot(rid, column, &buf)?;
        }
        Ok(())
    }

    /// Starts a merge attempt: captures the watermark and reserves a fresh
    /// generation.
    pub fn begin_merge_attempt(&self) -> Result<MergeTicket> {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        let last_slot = (generation as u64 + 1) * self.layout.base_capacity() as u64;
        if last_slot > u32::MAX as u64 {
            return Err(LStoreError::Internal(format!(
                "range {} ran out of merge generations",
                self.range_id
            )));
        }
        state.next_generation += 1;

        Ok(MergeTicket {
            generation,
            watermark: state.next_tail,
            sealed: state.settled_base >= self.layout.base_capacity(),
        })
    }

    /// Location of the `index`-th record of a merged generation.
    pub fn merged_rid(&self, generation: u32, index: u32) -> Rid {
        Rid::base(
            self.range_id,
            generation * self.layout.base_capacity() + index,
        )
    }

    /// Installs a conflict-free merge and reclaims superseded pages.
    ///
    /// Returns the number of pages dropped from the pool.
    pub fn finish_merge(&self, ticket: MergeTicket) -> Result<usize> {
        let superseded = {
            let mut state = self.state.lock();
            let mut pages = Vec::new();
            let spp = self.layout.slots_per_page;
            let bpr = self.layout.base_pages_per_range;

            for generation in state.reclaim_from_generation..ticket.generation {
                self.push_pages(&mut pages, PageKind::Base, generation * bpr..(generation + 1) * bpr);
            }
            state.reclaim_from_generation = ticket.generation;

            if ticket.sealed && !state.base_reclaimed {
                self.push_pages(&mut pages, PageKind::Base, 0..bpr);
                state.base_reclaimed = true;
            }

            let folded_tail_pages = ticket.watermark / spp;
            if folded_tail_pages > state.reclaimed_tail_pages {
                self.push_pages(
                    &mut pages,
                    PageKind::Tail,
                    state.reclaimed_tail_pages..folded_tail_pages,
                );
                state.reclaimed_tail_pages = folded_tail_pages;
            }

            state.generation = ticket.generation;
            state.watermark = state.watermark.max(ticket.watermark);
            pages
        };

        self.pending_reclaim.lock().extend(superseded);
        self.reclaim()
    }

    fn push_pages(&self, pages: &mut Vec<PageId>, kind: PageKind, page_nums: std::ops::Range<u32>) {
        let columns = (METADATA_COLUMNS + self.layout.num_columns()) as u16;
        for page_num in page_nums {
            for column in 0..columns {
                pages.push(PageId::new(
                    self.layout.table_id,
                    self.range_id,
                    kind,
                    column,
                    page_num,
                ));
            }
        }
    }

    /// Releases superseded pages from the pool, writing dirty ones back
    /// first. Pinned pages stay queued.
    pub fn reclaim(&self) -> Result<usize> {
        let _gate = self.gate.write();
        let mut pending = self.pending_reclaim.lock();

        let mut kept = Vec::new();
        let mut dropped = 0;
        let mut pages = std::mem::take(&mut *pending).into_iter();
        while let Some(page_id) = pages.next() {
            match self.pool.discard_page(page_id) {
                Ok(true) => dropped += 1,
                Ok(false) => kept.push(page_id),
                Err(e) => {
                    kept.push(page_id);
                    kept.extend(pages);
                    *pending = kept;
                    return Err(e);
                }
            }
        }

        if !kept.is_empty() {
            warn!(
                range = self.range_id,
                pinned = kept.len(),
                "deferred reclamation of pinned pages"
            );
        }
        debug!(range = self.range_id, dropped, "reclaimed superseded pages");
        *pending = kept;
        Ok(dropped)
    }

    /// Number of superseded pages awaiting reclamation.
    pub fn pending_reclaim(&self) -> usize {
        self.pending_reclaim.lock().len()
    }
}

impl std::fmt::Debug for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRange")
            .field("range_id", &self.range_id)
            .field("state", &self.state())
            .finish()
    }
}
