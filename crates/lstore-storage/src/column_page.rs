//! Column page slot codec.
//!
//! Page layout:
//! ```text
//! +------------------+
//! | Page Header (32) |
//! +------------------+
//! | Slot 0           |
//! | Slot 1           |  <- fixed width, one value per slot
//! | ...              |
//! +------------------+
//! | Unused tail      |
//! +------------------+
//! ```

use lstore_common::page::{PageHeader, PageId, PAGE_MAGIC};
use lstore_common::{LStoreError, Result};

/// Accessors for a page image holding one column's fixed-width slots.
pub struct ColumnPage;

impl ColumnPage {
    /// Formats an empty page image.
    pub fn init(buf: &mut [u8], page_id: PageId, slot_width: usize, capacity: usize) {
        buf.fill(0);
        PageHeader::new(page_id, slot_width as u16, capacity as u16).write_to(buf);
    }

    /// Reads the header without validating the checksum.
    pub fn header(buf: &[u8]) -> Result<PageHeader> {
        match PageHeader::read_from(buf) {
            (PAGE_MAGIC, Some(header)) => Ok(header),
            _ => Err(LStoreError::Internal(
                "column page accessed before initialization".to_string(),
            )),
        }
    }

    /// Returns the bytes of a slot.
    pub fn read_slot(buf: &[u8], slot: u16) -> Result<&[u8]> {
        let header = Self::header(buf)?;
        Self::check_slot(&header, slot)?;
        let start = header.slot_offset(slot);
        Ok(&buf[start..start + header.slot_width as usize])
    }

    /// Overwrites a slot and bumps the used-slot count.
    pub fn write_slot(buf: &mut [u8], slot: u16, value: &[u8]) -> Result<()> {
        let mut header = Self::header(buf)?;
        Self::check_slot(&header, slot)?;
        if value.len() != header.slot_width as usize {
            return Err(LStoreError::CorruptPage {
                page_id: header.page_id,
                reason: format!(
                    "slot write of {} bytes into {}-byte slots",
                    value.len(),
                    header.slot_width
                ),
            });
        }

        let start = header.slot_offset(slot);
        buf[start..start + value.len()].copy_from_slice(value);

        if slot >= header.used {
            header.used = slot + 1;
            header.write_to(buf);
        }
        Ok(())
    }

    fn check_slot(header: &PageHeader, slot: u16) -> Result<()> {
        if slot >= header.capacity {
            return Err(LStoreError::CorruptPage {
                page_id: header.page_id,
                reason: format!("slot {} beyond capacity {}", slot, header.capacity),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lstore_common::page::{PageKind, PAGE_SIZE};

    fn create_test_page(width: usize, capacity: usize) -> Vec<u8> {
        let mut buf = vec![0xEEu8; PAGE_SIZE];
        let page_id = PageId::new(0, 0, PageKind::Tail, 5, 1);
        ColumnPage::init(&mut buf, page_id, width, capacity);
        buf
    }

    #[test]
    fn test_init_clears_page() {
        let buf = create_test_page(8, 10);
        let header = ColumnPage::header(&buf).unwrap();

        assert_eq!(header.slot_width, 8);
        assert_eq!(header.capacity, 10);
        assert_eq!(header.used, 0);
        assert!(buf[PageHeader::SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_then_read_slot() {
        let mut buf = create_test_page(8, 10);

        ColumnPage::write_slot(&mut buf, 3, &42u64.to_le_bytes()).unwrap();

        let slot = ColumnPage::read_slot(&buf, 3).unwrap();
        assert_eq!(slot, &42u64.to_le_bytes());
        assert_eq!(ColumnPage::header(&buf).unwrap().used, 4);
        assert_eq!(ColumnPage::read_slot(&buf, 0).unwrap(), &[0u8; 8]);
    }

    #[test]
    fn test_used_count_never_shrinks() {
        let mut buf = create_test_page(4, 10);

        ColumnPage::write_slot(&mut buf, 6, &[1; 4]).unwrap();
        ColumnPage::write_slot(&mut buf, 2, &[2; 4]).unwrap();
        assert_eq!(ColumnPage::header(&buf).unwrap().used, 7);
    }

    #[test]
    fn test_slot_beyond_capacity() {
        let mut buf = create_test_page(8, 2);

        assert!(ColumnPage::read_slot(&buf, 2).is_err());
        let err = ColumnPage::write_slot(&mut buf, 5, &[0; 8]).unwrap_err();
        assert!(matches!(err, LStoreError::CorruptPage { .. }));
    }

    #[test]
    fn test_wrong_width_write() {
        let mut buf = create_test_page(8, 2);
        assert!(ColumnPage::write_slot(&mut buf, 0, &[0; 3]).is_err());
    }

    #[test]
    fn test_uninitialized_page() {
        let buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            ColumnPage::header(&buf),
            Err(LStoreError::Internal(_))
        ));
    }
}
