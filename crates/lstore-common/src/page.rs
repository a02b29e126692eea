//! Page identity and on-page header for LStore column pages.

use crate::error::{LStoreError, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Marks an initialized column page ("LSTP").
pub const PAGE_MAGIC: u32 = 0x4C53_5450;

/// Whether a page belongs to a range's base or tail segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageKind {
    /// Base page holding full record versions.
    Base = 0,
    /// Append-only tail page holding update deltas.
    Tail = 1,
}

impl PageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageKind::Base),
            1 => Some(PageKind::Tail),
            _ => None,
        }
    }

    /// Short name used in file names and display output.
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::Base => "base",
            PageKind::Tail => "tail",
        }
    }
}

/// Unique identifier for a column page.
///
/// Ordering is lexicographic over (table, range, kind, column, page number),
/// which the buffer pool relies on for deterministic eviction tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Owning table.
    pub table_id: u32,
    /// Owning page range within the table.
    pub range_id: u32,
    /// Base or tail segment.
    pub kind: PageKind,
    /// Physical column (metadata columns first, then data columns).
    pub column: u16,
    /// Page number within the (range, kind, column) segment.
    pub page_num: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(table_id: u32, range_id: u32, kind: PageKind, column: u16, page_num: u32) -> Self {
        Self {
            table_id,
            range_id,
            kind,
            column,
            page_num,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{}/r{}/{}/c{}/p{}",
            self.table_id,
            self.range_id,
            self.kind.as_str(),
            self.column,
            self.page_num
        )
    }
}

/// Header at the beginning of every column page.
///
/// Layout (32 bytes):
/// - magic: 4 bytes
/// - table_id: 4 bytes
/// - range_id: 4 bytes
/// - page_num: 4 bytes
/// - kind: 1 byte
/// - reserved: 1 byte
/// - column: 2 bytes
/// - slot_width: 2 bytes
/// - capacity: 2 bytes
/// - used: 2 bytes
/// - reserved: 2 bytes
/// - checksum: 4 bytes (CRC32 of the page with this field zeroed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page this header belongs to.
    pub page_id: PageId,
    /// Width of one slot in bytes.
    pub slot_width: u16,
    /// Number of slots the page can hold.
    pub capacity: u16,
    /// Highest written slot plus one.
    pub used: u16,
    /// Stored checksum (only meaningful after `stamp_checksum`).
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    const CHECKSUM_OFFSET: usize = 28;

    /// Creates a header for an empty page.
    pub fn new(page_id: PageId, slot_width: u16, capacity: u16) -> Self {
        Self {
            page_id,
            slot_width,
            capacity,
            used: 0,
            checksum: 0,
        }
    }

    /// Number of slots of `slot_width` bytes that fit after the header.
    pub fn slots_for_width(slot_width: usize) -> usize {
        if slot_width == 0 {
            return 0;
        }
        (PAGE_SIZE - Self::SIZE) / slot_width
    }

    /// Byte offset of a slot within the page.
    #[inline]
    pub fn slot_offset(&self, slot: u16) -> usize {
        Self::SIZE + slot as usize * self.slot_width as usize
    }

    /// Serializes the header into the first 32 bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        let mut out = &mut buf[..Self::SIZE];
        out.put_u32_le(PAGE_MAGIC);
        out.put_u32_le(self.page_id.table_id);
        out.put_u32_le(self.page_id.range_id);
        out.put_u32_le(self.page_id.page_num);
        out.put_u8(self.page_id.kind as u8);
        out.put_u8(0);
        out.put_u16_le(self.page_id.column);
        out.put_u16_le(self.slot_width);
        out.put_u16_le(self.capacity);
        out.put_u16_le(self.used);
        out.put_u16_le(0);
        out.put_u32_le(self.checksum);
    }

    /// Deserializes a header without validating it.
    ///
    /// Returns the magic value alongside the header so callers can tell an
    /// initialized page from a zeroed one.
    pub fn read_from(buf: &[u8]) -> (u32, Option<Self>) {
        let mut input = &buf[..Self::SIZE];
        let magic = input.get_u32_le();
        let table_id = input.get_u32_le();
        let range_id = input.get_u32_le();
        let page_num = input.get_u32_le();
        let kind = input.get_u8();
        input.advance(1);
        let column = input.get_u16_le();
        let slot_width = input.get_u16_le();
        let capacity = input.get_u16_le();
        let used = input.get_u16_le();
        input.advance(2);
        let checksum = input.get_u32_le();

        let header = PageKind::from_u8(kind).map(|kind| Self {
            page_id: PageId::new(table_id, range_id, kind, column, page_num),
            slot_width,
            capacity,
            used,
            checksum,
        });
        (magic, header)
    }

    /// Computes the checksum of a page image.
    pub fn compute_checksum(buf: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..Self::CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&buf[Self::CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }

    /// Writes the checksum of the page image into its header.
    pub fn stamp_checksum(buf: &mut [u8]) {
        let checksum = Self::compute_checksum(buf);
        buf[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 4]
            .copy_from_slice(&checksum.to_le_bytes());
    }

    /// Validates a page image loaded for `page_id`.
    pub fn verify(page_id: PageId, buf: &[u8]) -> Result<PageHeader> {
        let corrupt = |reason: String| LStoreError::CorruptPage { page_id, reason };

        if buf.len() != PAGE_SIZE {
            return Err(corrupt(format!(
                "expected {} bytes, got {}",
                PAGE_SIZE,
                buf.len()
            )));
        }

        let (magic, header) = Self::read_from(buf);
        if magic != PAGE_MAGIC {
            return Err(corrupt(format!("bad magic {:#010x}", magic)));
        }
        let header = header.ok_or_else(|| corrupt("unknown page kind".to_string()))?;

        if header.page_id != page_id {
            return Err(corrupt(format!("header names page {}", header.page_id)));
        }
        if header.slot_width == 0
            || header.capacity as usize > Self::slots_for_width(header.slot_width as usize)
        {
            return Err(corrupt(format!(
                "capacity {} does not fit slot width {}",
                header.capacity, header.slot_width
            )));
        }
        if header.used > header.capacity {
            return Err(corrupt(format!(
                "used slots {} exceed capacity {}",
                header.used, header.capacity
            )));
        }

        let computed = Self::compute_checksum(buf);
        if computed != header.checksum {
            return Err(corrupt(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                header.checksum, computed
            )));
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_page_id() -> PageId {
        PageId::new(2, 5, PageKind::Base, 6, 11)
    }

    fn sealed_page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = PageHeader::new(test_page_id(), 8, 100);
        header.used = 3;
        header.write_to(&mut buf);
        buf[PageHeader::SIZE] = 0xAB;
        PageHeader::stamp_checksum(&mut buf);
        buf
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(test_page_id().to_string(), "t2/r5/base/c6/p11");
    }

    #[test]
    fn test_page_id_ordering() {
        let a = PageId::new(0, 0, PageKind::Base, 0, 9);
        let b = PageId::new(0, 0, PageKind::Tail, 0, 0);
        let c = PageId::new(0, 1, PageKind::Base, 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_slots_for_width() {
        assert_eq!(PageHeader::slots_for_width(8), (PAGE_SIZE - 32) / 8);
        assert_eq!(PageHeader::slots_for_width(0), 0);
    }

    #[test]
    fn test_header_roundtrip() {
        let buf = sealed_page();
        let (magic, header) = PageHeader::read_from(&buf);
        let header = header.unwrap();

        assert_eq!(magic, PAGE_MAGIC);
        assert_eq!(header.page_id, test_page_id());
        assert_eq!(header.slot_width, 8);
        assert_eq!(header.capacity, 100);
        assert_eq!(header.used, 3);
    }

    #[test]
    fn test_verify_accepts_sealed_page() {
        let buf = sealed_page();
        let header = PageHeader::verify(test_page_id(), &buf).unwrap();
        assert_eq!(header.used, 3);
    }

    #[test]
    fn test_verify_detects_bit_flip() {
        let mut buf = sealed_page();
        buf[PAGE_SIZE - 1] ^= 0x01;

        let err = PageHeader::verify(test_page_id(), &buf).unwrap_err();
        assert!(matches!(err, LStoreError::CorruptPage { .. }));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_verify_rejects_short_buffer() {
        let err = PageHeader::verify(test_page_id(), &[0u8; 100]).unwrap_err();
        assert!(err.to_string().contains("expected 4096 bytes"));
    }

    #[test]
    fn test_verify_rejects_zeroed_page() {
        let err = PageHeader::verify(test_page_id(), &vec![0u8; PAGE_SIZE]).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_verify_rejects_wrong_page() {
        let buf = sealed_page();
        let other = PageId::new(2, 5, PageKind::Tail, 6, 11);
        let err = PageHeader::verify(other, &buf).unwrap_err();
        assert!(err.to_string().contains("header names page"));
    }

    #[test]
    fn test_slot_offset() {
        let header = PageHeader::new(test_page_id(), 10, 50);
        assert_eq!(header.slot_offset(0), PageHeader::SIZE);
        assert_eq!(header.slot_offset(3), PageHeader::SIZE + 30);
    }
}
