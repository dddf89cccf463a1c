//! Trace buffer control block

use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{AtomicU32, Ordering};

/// Control fields in wire order. Atomics have the layout of the plain
/// integers, so this is the first 40 bytes of [`RawBufferHeader`].
#[repr(C)]
#[derive(Debug)]
pub struct BufferHeader {
    pub(crate) full: AtomicU32,
    pub(crate) analysis: AtomicU32,
    pub(crate) head_index: AtomicU32,
    pub(crate) tail_index: AtomicU32,
    pub(crate) size: u32,
    /// Live producer groups; 0 means the kernel is finished
    pub(crate) num_threads: AtomicU32,
    pub(crate) block_sampling_offset: u32,
    pub(crate) block_sampling_frequency: u32,
    pub(crate) record_type: u32,
    pub(crate) flags: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<BufferHeader>(), 40);

/// The complete header as the device sees it, with the three storage
/// references as device addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RawBufferHeader {
    pub full: u32,
    pub analysis: u32,
    pub head_index: u32,
    pub tail_index: u32,
    pub size: u32,
    pub num_threads: u32,
    pub block_sampling_offset: u32,
    pub block_sampling_frequency: u32,
    pub record_type: u32,
    pub flags: u32,
    pub records: u64,
    pub aux: u64,
    pub torch_aux: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawBufferHeader>(), 64);

/// A granted slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub slot: u32,
    /// This reservation made the buffer reach capacity
    pub filled: bool,
}

impl BufferHeader {
    /// Reserve the slot at `head_index`, or `None` while `full` is set.
    // SeqCst keeps a producer's `full` store ordered against the host's
    // tail update, so a stale `full` always has an unpublished slot behind it.
    pub(crate) fn reserve(&self) -> Option<Reservation> {
        loop {
            if self.full.load(Ordering::SeqCst) != 0 {
                return None;
            }
            let head = self.head_index.load(Ordering::SeqCst);
            let next = (head + 1) % self.size;
            if self
                .head_index
                .compare_exchange_weak(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let filled = next == self.tail_index.load(Ordering::SeqCst);
                if filled {
                    self.full.store(1, Ordering::SeqCst);
                }
                return Some(Reservation { slot: head, filled });
            }
            std::hint::spin_loop();
        }
    }

    /// Records between tail and head. Only an estimate while producers run.
    pub(crate) fn pending(&self) -> u32 {
        if self.full.load(Ordering::Acquire) != 0 {
            return self.size;
        }
        let head = self.head_index.load(Ordering::Acquire);
        let tail = self.tail_index.load(Ordering::Acquire);
        (head + self.size - tail) % self.size
    }

    pub(crate) fn snapshot(&self, records: u64, aux: u64, torch_aux: u64) -> RawBufferHeader {
        RawBufferHeader {
            full: self.full.load(Ordering::Acquire),
            analysis: self.analysis.load(Ordering::Acquire),
            head_index: self.head_index.load(Ordering::Acquire),
            tail_index: self.tail_index.load(Ordering::Acquire),
            size: self.size,
            num_threads: self.num_threads.load(Ordering::Acquire),
            block_sampling_offset: self.block_sampling_offset,
            block_sampling_frequency: self.block_sampling_frequency,
            record_type: self.record_type,
            flags: self.flags,
            records,
            aux,
            torch_aux,
        }
    }
}
