//! Record store backing a trace buffer
//!
//! Records sit in one contiguous array with the element layout of the C
//! record array. A parallel array of ready flags tells the host which slots
//! hold a finished record: a producer may reserve a slot before the host has
//! drained the record still in it, so it waits on the flag instead of
//! overwriting.

use super::Backoff;
use bytemuck::Pod;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct RecordRing<T> {
    records: Box<[UnsafeCell<T>]>,
    ready: Box<[AtomicBool]>,
}

// SAFETY: a slot's value is only written by the producer that reserved it
// while its ready flag is clear, and only read by the host after observing
// the flag set (Release/Acquire pair on `ready`).
unsafe impl<T: Send> Sync for RecordRing<T> {}

impl<T: Pod> RecordRing<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: (0..capacity).map(|_| UnsafeCell::new(bytemuck::Zeroable::zeroed())).collect(),
            ready: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Write `record` into a reserved slot, waiting for the slot's previous
    /// record to be drained first.
    pub(crate) fn publish(&self, slot: usize, record: T) {
        let backoff = Backoff::new();
        while self.ready[slot].load(Ordering::Acquire) {
            backoff.snooze();
        }
        // SAFETY: the slot was reserved by this producer alone and the host
        // has released it.
        unsafe { *self.records[slot].get() = record };
        self.ready[slot].store(true, Ordering::Release);
    }

    /// Take the record in `slot` if one has been published.
    pub(crate) fn take(&self, slot: usize) -> Option<T> {
        if !self.ready[slot].load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the producer finished writing before setting the flag and
        // will not touch the slot again until it is cleared.
        let record = unsafe { *self.records[slot].get() };
        self.ready[slot].store(false, Ordering::Release);
        Some(record)
    }

    pub(crate) fn is_ready(&self, slot: usize) -> bool {
        self.ready[slot].load(Ordering::Acquire)
    }

    /// Device address of the record array.
    pub fn device_addr(&self) -> u64 {
        self.records.as_ptr() as u64
    }
}

impl<T> std::fmt::Debug for RecordRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRing")
            .field("capacity", &self.records.len())
            .finish()
    }
}
