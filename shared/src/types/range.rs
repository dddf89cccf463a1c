//! Address ranges shared by both auxiliary structures

use crate::error::PatchError;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// A `[start, end)` device address interval.
///
/// This is also the analysis record: the value queued when the address
/// dictionary cannot take another entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AddressRange>(), 16);

impl AddressRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: u64, end: u64) -> Result<Self, PatchError> {
        if start > end {
            return Err(PatchError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Range covered by an access of `size` bytes at `address`.
    pub fn from_access(address: u64, size: u32) -> Self {
        Self {
            start: address,
            end: address.saturating_add(size as u64),
        }
    }

    /// Half-open containment. A zero-width range holds its start address.
    pub fn contains(&self, address: u64) -> bool {
        if self.start == self.end {
            return address == self.start;
        }
        address >= self.start && address < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when the two half-open intervals share at least one address.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}
