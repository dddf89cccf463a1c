//! TorchView range-touch tracking
//!
//! The host declares the memory views of a function's tensor inputs before
//! launch. Producers binary-search each accessed address against those
//! views and set one bit per (instruction, view) in a read or write bitmap.
//! After the kernel the host reads the bitmaps back to work out which
//! instructions used which inputs.
//!
//! Row `r` covers the instruction at `function_pc_offset + 8 * r`; view `i`
//! lives in word `i / 64`, bit `i % 64` of the row. Each row has
//! `ceil(n / 64) + 1` words.

use crate::error::PatchError;
use crate::types::flags::AccessFlags;
use crate::types::range::AddressRange;
use crate::types::{BITMAP_WORD_BITS, PC_STRIDE};
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{AtomicU64, Ordering};

/// The C control block as the device sees it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RawTorchViewHeader {
    pub function_pc_offset: u64,
    pub view_range_size: u32,
    pub _pad: u32,
    pub start_end: u64,
    pub current_read_pc_size: u64,
    pub current_write_pc_size: u64,
    pub read_pc_range_bit_map: u64,
    pub write_pc_range_bit_map: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawTorchViewHeader>(), 56);

/// Result of marking one lane access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Marked { row: usize, range: usize },
    /// The address is outside every view
    NoRange,
    /// The pc maps outside the allocated rows; nothing was written
    OutOfBounds,
}

pub struct TorchViewDict {
    function_pc_offset: u64,
    view_range_size: u32,
    ranges: Box<[AddressRange]>,
    rows: usize,
    words_per_row: usize,
    read: Box<[AtomicU64]>,
    write: Box<[AtomicU64]>,
}

impl TorchViewDict {
    /// Allocate zeroed bitmaps for `rows` instructions. `ranges` must be
    /// sorted by start and must not overlap.
    pub fn new(
        function_pc_offset: u64,
        ranges: Vec<AddressRange>,
        rows: usize,
    ) -> Result<Self, PatchError> {
        if rows == 0 {
            return Err(PatchError::NoInstructionRows);
        }
        for (index, range) in ranges.iter().enumerate() {
            if range.start > range.end {
                return Err(PatchError::InvalidRange {
                    start: range.start,
                    end: range.end,
                });
            }
            if index == 0 {
                continue;
            }
            let prev = &ranges[index - 1];
            if range.start < prev.start {
                return Err(PatchError::UnsortedRanges { index });
            }
            if range.start < prev.end {
                return Err(PatchError::OverlappingRanges { index });
            }
        }

        let too_large = PatchError::ViewTableTooLarge {
            views: ranges.len(),
            rows,
        };
        let view_range_size = u32::try_from(ranges.len()).map_err(|_| too_large.clone())?;
        let words_per_row = ranges.len().div_ceil(BITMAP_WORD_BITS) + 1;
        let words = rows.checked_mul(words_per_row).ok_or(too_large)?;
        Ok(Self {
            function_pc_offset,
            view_range_size,
            ranges: ranges.into_boxed_slice(),
            rows,
            words_per_row,
            read: (0..words).map(|_| AtomicU64::new(0)).collect(),
            write: (0..words).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    /// Index of the view containing `address`.
    pub fn find(&self, address: u64) -> Option<usize> {
        let index = self.ranges.partition_point(|r| r.start <= address).checked_sub(1)?;
        self.ranges[index].contains(address).then_some(index)
    }

    /// Bitmap row for `pc`, if it falls inside the allocated rows.
    pub fn row_of(&self, pc: u64) -> Option<usize> {
        let row = (pc.checked_sub(self.function_pc_offset)? / PC_STRIDE) as usize;
        (row < self.rows).then_some(row)
    }

    /// Mark the view containing `address` as read and/or written by the
    /// instruction at `pc`.
    pub fn touch(&self, pc: u64, address: u64, flags: AccessFlags) -> TouchOutcome {
        let Some(row) = self.row_of(pc) else {
            return TouchOutcome::OutOfBounds;
        };
        let Some(range) = self.find(address) else {
            return TouchOutcome::NoRange;
        };
        self.mark(row, range, flags);
        TouchOutcome::Marked { row, range }
    }

    /// Set the bits for `(row, range)`. Returns false if either is out of
    /// bounds.
    pub fn mark(&self, row: usize, range: usize, flags: AccessFlags) -> bool {
        let Some((word, bit)) = self.locate(row, range) else {
            return false;
        };
        if flags.contains(AccessFlags::READ) {
            self.read[word].fetch_or(bit, Ordering::Relaxed);
        }
        if flags.contains(AccessFlags::WRITE) {
            self.write[word].fetch_or(bit, Ordering::Relaxed);
        }
        true
    }

    fn locate(&self, row: usize, range: usize) -> Option<(usize, u64)> {
        if row >= self.rows || range >= self.ranges.len() {
            return None;
        }
        let word = row * self.words_per_row + range / BITMAP_WORD_BITS;
        Some((word, 1u64 << (range % BITMAP_WORD_BITS)))
    }

    fn test(map: &[AtomicU64], slot: Option<(usize, u64)>) -> bool {
        slot.is_some_and(|(word, bit)| map[word].load(Ordering::Relaxed) & bit != 0)
    }

    pub fn is_read(&self, row: usize, range: usize) -> bool {
        Self::test(&self.read, self.locate(row, range))
    }

    pub fn is_written(&self, row: usize, range: usize) -> bool {
        Self::test(&self.write, self.locate(row, range))
    }

    /// Rows that read view `range`, ascending.
    pub fn read_rows(&self, range: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.rows).filter(move |&row| self.is_read(row, range))
    }

    /// Rows that wrote view `range`, ascending.
    pub fn write_rows(&self, range: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.rows).filter(move |&row| self.is_written(row, range))
    }

    pub fn function_pc_offset(&self) -> u64 {
        self.function_pc_offset
    }

    /// Program counter of bitmap row `row`.
    pub fn pc_of(&self, row: usize) -> u64 {
        self.function_pc_offset + row as u64 * PC_STRIDE
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn words_per_row(&self) -> usize {
        self.words_per_row
    }

    pub fn device_addr(&self) -> u64 {
        self as *const Self as u64
    }

    pub fn raw_header(&self) -> RawTorchViewHeader {
        RawTorchViewHeader {
            function_pc_offset: self.function_pc_offset,
            view_range_size: self.view_range_size,
            _pad: 0,
            start_end: self.ranges.as_ptr() as u64,
            current_read_pc_size: self.rows as u64,
            current_write_pc_size: self.rows as u64,
            read_pc_range_bit_map: self.read.as_ptr() as u64,
            write_pc_range_bit_map: self.write.as_ptr() as u64,
        }
    }
}

impl std::fmt::Debug for TorchViewDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorchViewDict")
            .field("function_pc_offset", &self.function_pc_offset)
            .field("view_ranges", &self.ranges.len())
            .field("rows", &self.rows)
            .finish()
    }
}
