//! Record identifiers, metadata columns and logical records.

use crate::txn::TxMarker;
use lstore_common::page::PageKind;
use lstore_common::Value;
use serde::{Deserialize, Serialize};

/// Physical column holding the packed RID of the previous version.
pub const INDIRECTION_COLUMN: u16 = 0;
/// Physical column holding the packed RID of the version itself.
pub const RID_COLUMN: u16 = 1;
/// Physical column holding the version-clock tick of the write.
pub const TIMESTAMP_COLUMN: u16 = 2;
/// Physical column holding the bitmask of data columns in the version.
pub const SCHEMA_ENCODING_COLUMN: u16 = 3;
/// Number of metadata columns preceding the data columns.
pub const METADATA_COLUMNS: usize = 4;

/// Maximum number of data columns in a table.
pub const MAX_DATA_COLUMNS: usize = 62;
/// Schema-encoding bit marking a deleted record.
pub const TOMBSTONE_BIT: u64 = 1 << 63;

const KIND_BIT: u64 = 1 << 62;
const RANGE_SHIFT: u32 = 32;
const RANGE_MASK: u64 = (1 << 30) - 1;

/// Largest range id a RID can carry.
pub const MAX_RANGE_ID: u32 = RANGE_MASK as u32;

/// Physical location of one record version.
///
/// Slot numbers count across pages: with `spp` slots per page, slot `s`
/// lives at page `s / spp`, offset `s % spp`, in every column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub range_id: u32,
    pub kind: PageKind,
    pub slot: u32,
}

impl Rid {
    /// Packed value terminating an indirection chain.
    pub const NONE: u64 = u64::MAX;

    /// Creates a new Rid.
    pub fn new(range_id: u32, kind: PageKind, slot: u32) -> Self {
        Self {
            range_id,
            kind,
            slot,
        }
    }

    /// Creates a base-page Rid.
    pub fn base(range_id: u32, slot: u32) -> Self {
        Self::new(range_id, PageKind::Base, slot)
    }

    /// Creates a tail-page Rid.
    pub fn tail(range_id: u32, slot: u32) -> Self {
        Self::new(range_id, PageKind::Tail, slot)
    }

    /// Packs the Rid into a non-negative u64.
    pub fn pack(&self) -> u64 {
        let kind = match self.kind {
            PageKind::Base => 0,
            PageKind::Tail => KIND_BIT,
        };
        kind | ((self.range_id as u64 & RANGE_MASK) << RANGE_SHIFT) | self.slot as u64
    }

    /// Unpacks a value written by [`Rid::pack`]. Returns None for `Rid::NONE`.
    pub fn unpack(packed: u64) -> Option<Self> {
        if packed == Self::NONE {
            return None;
        }
        let kind = if packed & KIND_BIT != 0 {
            PageKind::Tail
        } else {
            PageKind::Base
        };
        Some(Self {
            range_id: ((packed >> RANGE_SHIFT) & RANGE_MASK) as u32,
            kind,
            slot: packed as u32,
        })
    }

    /// Page number holding this version.
    #[inline]
    pub fn page_num(&self, slots_per_page: u32) -> u32 {
        self.slot / slots_per_page
    }

    /// Offset of this version within its page.
    #[inline]
    pub fn offset(&self, slots_per_page: u32) -> u16 {
        (self.slot % slots_per_page) as u16
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}/{}/s{}", self.range_id, self.kind.as_str(), self.slot)
    }
}

/// Which version of a record a read observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSpec {
    /// Most recent version.
    #[default]
    Latest,
    /// Newest version written before the marker was taken.
    AsOf(TxMarker),
    /// The version `n` steps behind the latest, clamped at the oldest
    /// retained version.
    Relative(u32),
}

/// A projected record version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Location of the latest version.
    pub rid: Rid,
    /// Primary key.
    pub key: Value,
    /// Requested column values, in request order.
    pub values: Vec<Value>,
}

/// Bitmask of data columns carried by a version.
#[inline]
pub fn column_mask(columns: impl IntoIterator<Item = usize>) -> u64 {
    columns.into_iter().fold(0, |mask, c| mask | (1u64 << c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_pack_unpack() {
        let rids = [
            Rid::base(0, 0),
            Rid::base(7, 123_456),
            Rid::tail(MAX_RANGE_ID, u32::MAX),
            Rid::tail(1, 0),
        ];
        for rid in rids {
            let packed = rid.pack();
            assert_ne!(packed, Rid::NONE);
            assert!(packed < 1 << 63);
            assert_eq!(Rid::unpack(packed), Some(rid));
        }
    }

    #[test]
    fn test_rid_none() {
        assert_eq!(Rid::unpack(Rid::NONE), None);
    }

    #[test]
    fn test_rid_kind_distinguishes() {
        assert_ne!(Rid::base(3, 9).pack(), Rid::tail(3, 9).pack());
    }

    #[test]
    fn test_rid_location() {
        let rid = Rid::tail(0, 1021);
        assert_eq!(rid.page_num(508), 2);
        assert_eq!(rid.offset(508), 5);
    }

    #[test]
    fn test_rid_display() {
        assert_eq!(Rid::tail(2, 17).to_string(), "r2/tail/s17");
    }

    #[test]
    fn test_column_mask() {
        assert_eq!(column_mask([0, 2]), 0b101);
        assert_eq!(column_mask(std::iter::empty()), 0);
        assert_eq!(column_mask([61]) & TOMBSTONE_BIT, 0);
    }
}
