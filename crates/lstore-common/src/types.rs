//! Column types and values stored in LStore tables.

use crate::error::{LStoreError, Result};
use crate::page::{PageHeader, PageId, PAGE_SIZE};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Type of a data column.
///
/// Every type has a fixed slot width so a column page is an array of
/// equal-sized slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int,
    /// UTF-8 text of at most the given number of bytes.
    Text(u16),
}

impl ColumnType {
    /// Width of one slot of this type in bytes.
    pub fn slot_width(&self) -> usize {
        match self {
            ColumnType::Int => 8,
            ColumnType::Text(width) => 2 + *width as usize,
        }
    }

    /// Returns the SQL-ish name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Int => "INT",
            ColumnType::Text(_) => "TEXT",
        }
    }

    /// Checks that at least one slot of this type fits in a page.
    pub fn validate(&self, column: usize) -> Result<()> {
        let max = PAGE_SIZE - PageHeader::SIZE;
        match self {
            ColumnType::Text(0) => Err(LStoreError::InvalidParameter {
                name: format!("column {} width", column),
                value: "0".to_string(),
            }),
            ColumnType::Text(width) if self.slot_width() > max => Err(LStoreError::ValueTooLarge {
                column,
                size: *width as usize,
                max: max - 2,
            }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Int => write!(f, "INT"),
            ColumnType::Text(width) => write!(f, "TEXT({})", width),
        }
    }
}

/// A single column value.
///
/// Values are totally ordered with every `Int` sorting before every `Text`,
/// so any column can back an ordered index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl Value {
    /// Returns the type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "INT",
            Value::Text(_) => "TEXT",
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    /// Returns the text payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Int(_) => None,
            Value::Text(s) => Some(s),
        }
    }

    /// Checks that this value can be stored in a column of type `ty`.
    pub fn check(&self, ty: ColumnType, column: usize) -> Result<()> {
        match (self, ty) {
            (Value::Int(_), ColumnType::Int) => Ok(()),
            (Value::Text(s), ColumnType::Text(width)) => {
                if s.len() > width as usize {
                    Err(LStoreError::ValueTooLarge {
                        column,
                        size: s.len(),
                        max: width as usize,
                    })
                } else {
                    Ok(())
                }
            }
            _ => Err(LStoreError::TypeMismatch {
                column,
                expected: ty.name().to_string(),
                actual: self.type_name().to_string(),
            }),
        }
    }

    /// Encodes the value into a slot of `ty.slot_width()` bytes.
    pub fn encode(&self, ty: ColumnType, column: usize, slot: &mut [u8]) -> Result<()> {
        self.check(ty, column)?;
        let mut out = &mut slot[..ty.slot_width()];
        match self {
            Value::Int(v) => out.put_i64_le(*v),
            Value::Text(s) => {
                out.put_u16_le(s.len() as u16);
                out.put_slice(s.as_bytes());
                let padding = out.remaining_mut();
                out.put_bytes(0, padding);
            }
        }
        Ok(())
    }

    /// Decodes a slot of `page_id` written by [`Value::encode`].
    ///
    /// A text length past the column width or bytes that are not UTF-8
    /// mean the page is corrupt.
    pub fn decode(ty: ColumnType, page_id: PageId, slot: &[u8]) -> Result<Value> {
        let mut input = &slot[..ty.slot_width()];
        match ty {
            ColumnType::Int => Ok(Value::Int(input.get_i64_le())),
            ColumnType::Text(width) => {
                let len = input.get_u16_le() as usize;
                if len > width as usize {
                    return Err(LStoreError::CorruptPage {
                        page_id,
                        reason: format!("text length {} exceeds width {}", len, width),
                    });
                }
                String::from_utf8(input[..len].to_vec())
                    .map(Value::Text)
                    .map_err(|e| LStoreError::CorruptPage {
                        page_id,
                        reason: format!("text slot is not UTF-8: {}", e),
                    })
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{:?}", s),
        }
    }
}
