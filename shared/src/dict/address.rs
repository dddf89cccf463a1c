//! On-device address deduplication dictionary
//!
//! A fixed table of address ranges with accumulated hit/read/write facts.
//! Producers look up the range of every access; only the first access to a
//! range claims a new slot, every later one just ORs its flags in.
//!
//! Insertion is serialized through `claim`, which lives in the padding word
//! the C layout leaves after `size`:
//!
//! 1. wait for `count` to catch up with the claimed slots,
//! 2. scan the published entries for a match,
//! 3. CAS `claim` from `n` to `n + 1`; the winner fills slot `n` and
//!    publishes `count = n + 1`, everybody else starts over.
//!
//! Because a slot is only claimed after every earlier slot has been scanned,
//! the same range is never stored twice.
//!
//! When the table is full the update is dropped and `claim` keeps counting
//! past capacity, so the host can tell after the launch how many updates
//! were lost (see [`AddressDict::overflowed`]). The count saturates at
//! `u32::MAX - CAPACITY`.

use crate::buffer::Backoff;
use crate::types::flags::AccessFlags;
use crate::types::range::AddressRange;
use crate::types::ADDRESS_DICT_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// An [`AddressRange`] slot with atomic halves; same layout as the plain
/// range.
#[repr(C)]
#[derive(Debug, Default)]
pub struct AtomicRange {
    start: AtomicU64,
    end: AtomicU64,
}

impl AtomicRange {
    fn load(&self) -> AddressRange {
        AddressRange {
            start: self.start.load(Ordering::Relaxed),
            end: self.end.load(Ordering::Relaxed),
        }
    }

    fn store(&self, range: AddressRange) {
        self.start.store(range.start, Ordering::Relaxed);
        self.end.store(range.end, Ordering::Relaxed);
    }
}

/// Result of a dictionary update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictUpdate {
    /// The range was already present at this index
    Hit(usize),
    /// The range was appended at this index
    Inserted(usize),
    /// The table was full; the update was dropped
    Overflow,
}

/// Host-side snapshot of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictEntry {
    pub range: AddressRange,
    pub hit: bool,
    pub read: bool,
    pub write: bool,
}

#[repr(C)]
pub struct AddressDict {
    count: AtomicU32,
    claim: AtomicU32,
    start_end: [AtomicRange; ADDRESS_DICT_SIZE],
    hit: [AtomicU8; ADDRESS_DICT_SIZE],
    read: [AtomicU8; ADDRESS_DICT_SIZE],
    write: [AtomicU8; ADDRESS_DICT_SIZE],
}

static_assertions::const_assert_eq!(std::mem::size_of::<AddressDict>(), 19464);

impl AddressDict {
    pub const CAPACITY: usize = ADDRESS_DICT_SIZE;

    /// Allocate a zeroed dictionary on the heap.
    pub fn new() -> Box<Self> {
        Box::new(Self {
            count: AtomicU32::new(0),
            claim: AtomicU32::new(0),
            start_end: std::array::from_fn(|_| AtomicRange::default()),
            hit: std::array::from_fn(|_| AtomicU8::new(0)),
            read: std::array::from_fn(|_| AtomicU8::new(0)),
            write: std::array::from_fn(|_| AtomicU8::new(0)),
        })
    }

    /// Record an access to `range`. Safe to call from any number of threads.
    pub fn update(&self, range: AddressRange, flags: AccessFlags) -> DictUpdate {
        let backoff = Backoff::new();
        loop {
            let claimed = self.claim.load(Ordering::Acquire);
            let target = (claimed as usize).min(Self::CAPACITY) as u32;

            // Another producer holds a slot it hasn't published yet.
            let published = self.count.load(Ordering::Acquire);
            if published != target {
                backoff.snooze();
                continue;
            }

            if let Some(index) = self.find(range, published as usize) {
                self.mark(index, flags);
                return DictUpdate::Hit(index);
            }

            if target as usize >= Self::CAPACITY {
                // Saturate: a wrapped claim would never match `count` again.
                let _ = self.claim.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                    Some(c.saturating_add(1))
                });
                return DictUpdate::Overflow;
            }

            if self
                .claim
                .compare_exchange(claimed, claimed + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            let index = claimed as usize;
            self.start_end[index].store(range);
            self.mark(index, flags);
            self.count.store(claimed + 1, Ordering::Release);
            return DictUpdate::Inserted(index);
        }
    }

    fn find(&self, range: AddressRange, len: usize) -> Option<usize> {
        self.start_end[..len].iter().position(|slot| slot.load() == range)
    }

    fn mark(&self, index: usize, flags: AccessFlags) {
        self.hit[index].store(1, Ordering::Relaxed);
        if flags.contains(AccessFlags::READ) {
            self.read[index].store(1, Ordering::Relaxed);
        }
        if flags.contains(AccessFlags::WRITE) {
            self.write[index].store(1, Ordering::Relaxed);
        }
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates dropped because the table was full.
    pub fn overflowed(&self) -> u32 {
        self.claim
            .load(Ordering::Acquire)
            .saturating_sub(Self::CAPACITY as u32)
    }

    pub fn get(&self, index: usize) -> Option<DictEntry> {
        if index >= self.len() {
            return None;
        }
        Some(DictEntry {
            range: self.start_end[index].load(),
            hit: self.hit[index].load(Ordering::Relaxed) != 0,
            read: self.read[index].load(Ordering::Relaxed) != 0,
            write: self.write[index].load(Ordering::Relaxed) != 0,
        })
    }

    /// Snapshot of entries `0..len`.
    pub fn entries(&self) -> Vec<DictEntry> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }

    /// Device address of the table, for the buffer header.
    pub fn device_addr(&self) -> u64 {
        self as *const Self as u64
    }
}

impl std::fmt::Debug for AddressDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressDict")
            .field("len", &self.len())
            .field("overflowed", &self.overflowed())
            .finish()
    }
}
