//! Bounded multi-producer / single-consumer trace buffer
//!
//! Producers reserve a slot by advancing `head_index` modulo `size`; the
//! reservation that makes `head_index` catch up with `tail_index` sets
//! `full`, and nobody reserves again until the host has drained. The host
//! copies records out from `tail_index`, moves `tail_index` forward and
//! clears `full`.
//!
//! Records are conserved by the per-slot ready flags in [`RecordRing`], not
//! by the indices: a producer that wins a slot whose previous record is
//! still undrained waits for it, and the host only drains published slots.
//! Ordering across producers is unspecified.

mod backoff;
mod header;
mod ring;

pub use backoff::Backoff;
pub use header::{BufferHeader, RawBufferHeader};
pub use ring::RecordRing;

use crate::dict::address::{AddressDict, DictUpdate};
use crate::dict::torchview::TorchViewDict;
use crate::error::PatchError;
use crate::types::flags::{AccessFlags, RecordType};
use crate::types::range::AddressRange;
use crate::types::record::{AddressRecord, PatchRecord, WarpAccess};
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Typed record storage, selected by the buffer's record type
#[derive(Debug)]
pub enum RecordStore {
    Full(RecordRing<PatchRecord>),
    Address(RecordRing<AddressRecord>),
    /// Analysis mode owns the dictionary; the ring only takes ranges the
    /// dictionary had no room for.
    Analysis {
        ring: RecordRing<AddressRange>,
        dict: Box<AddressDict>,
    },
}

impl RecordStore {
    fn new(record_type: RecordType, capacity: usize) -> Self {
        match record_type {
            RecordType::Full => RecordStore::Full(RecordRing::new(capacity)),
            RecordType::Address => RecordStore::Address(RecordRing::new(capacity)),
            RecordType::AddressAnalysis => RecordStore::Analysis {
                ring: RecordRing::new(capacity),
                dict: AddressDict::new(),
            },
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            RecordStore::Full(_) => RecordType::Full,
            RecordStore::Address(_) => RecordType::Address,
            RecordStore::Analysis { .. } => RecordType::AddressAnalysis,
        }
    }

    fn device_addr(&self) -> u64 {
        match self {
            RecordStore::Full(ring) => ring.device_addr(),
            RecordStore::Address(ring) => ring.device_addr(),
            RecordStore::Analysis { ring, .. } => ring.device_addr(),
        }
    }
}

/// A record type that can be queued in a [`TraceBuffer`].
pub trait TraceRecord: Pod + Send {
    const TYPE: RecordType;

    fn ring(store: &RecordStore) -> Option<&RecordRing<Self>>;
}

impl TraceRecord for PatchRecord {
    const TYPE: RecordType = RecordType::Full;

    fn ring(store: &RecordStore) -> Option<&RecordRing<Self>> {
        match store {
            RecordStore::Full(ring) => Some(ring),
            _ => None,
        }
    }
}

impl TraceRecord for AddressRecord {
    const TYPE: RecordType = RecordType::Address;

    fn ring(store: &RecordStore) -> Option<&RecordRing<Self>> {
        match store {
            RecordStore::Address(ring) => Some(ring),
            _ => None,
        }
    }
}

impl TraceRecord for AddressRange {
    const TYPE: RecordType = RecordType::AddressAnalysis;

    fn ring(store: &RecordStore) -> Option<&RecordRing<Self>> {
        match store {
            RecordStore::Analysis { ring, .. } => Some(ring),
            _ => None,
        }
    }
}

/// Records copied out by one drain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainedRecords {
    Full(Vec<PatchRecord>),
    Address(Vec<AddressRecord>),
    Analysis(Vec<AddressRange>),
}

impl DrainedRecords {
    pub fn len(&self) -> usize {
        match self {
            DrainedRecords::Full(r) => r.len(),
            DrainedRecords::Address(r) => r.len(),
            DrainedRecords::Analysis(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            DrainedRecords::Full(_) => RecordType::Full,
            DrainedRecords::Address(_) => RecordType::Address,
            DrainedRecords::Analysis(_) => RecordType::AddressAnalysis,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AppendError {
    #[error("trace buffer is full")]
    Full,

    #[error("trace buffer stayed full for {polls} polls; record dropped")]
    Stalled { polls: u64 },

    #[error("trace buffer was aborted by the host; record dropped")]
    Aborted,

    #[error("buffer stores {expected:?} records, got {actual:?}")]
    WrongRecordType {
        expected: RecordType,
        actual: RecordType,
    },
}

/// What a producer call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A record was written to `slot`
    Queued { slot: u32, filled: bool },
    /// Analysis mode: the dictionary absorbed the access
    Analyzed {
        hits: u32,
        inserted: u32,
        overflowed: u32,
    },
    /// Unsampled block or uncaptured access kind
    Skipped,
}

/// Shared trace buffer: control block, record store and the optional
/// auxiliary structures.
#[derive(Debug)]
pub struct TraceBuffer {
    header: BufferHeader,
    store: RecordStore,
    torchview: Option<TorchViewDict>,
    producer_spin_limit: Option<u64>,
    dropped: AtomicU64,
    aborted: AtomicBool,
}

/// Host-side allocation of a [`TraceBuffer`]
#[derive(Debug)]
pub struct TraceBufferBuilder {
    capacity: u32,
    record_type: RecordType,
    flags: AccessFlags,
    block_sampling_offset: u32,
    block_sampling_frequency: u32,
    num_threads: u32,
    torchview: Option<TorchViewDict>,
    producer_spin_limit: Option<u64>,
}

impl TraceBufferBuilder {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            record_type: RecordType::Full,
            flags: AccessFlags::empty(),
            block_sampling_offset: 0,
            block_sampling_frequency: 0,
            num_threads: 1,
            torchview: None,
            producer_spin_limit: None,
        }
    }

    pub fn record_type(mut self, record_type: RecordType) -> Self {
        self.record_type = record_type;
        self
    }

    /// Access kinds to capture; empty captures everything.
    pub fn flags(mut self, flags: AccessFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sample block `b` iff `b % frequency == offset`. Frequency 0 or 1
    /// samples every block.
    pub fn block_sampling(mut self, offset: u32, frequency: u32) -> Self {
        self.block_sampling_offset = offset;
        self.block_sampling_frequency = frequency;
        self
    }

    /// Producer groups expected to call [`TraceBuffer::finish_group`].
    pub fn num_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn torchview(mut self, dict: TorchViewDict) -> Self {
        self.torchview = Some(dict);
        self
    }

    /// Polls a producer waits on a full buffer before dropping its record.
    pub fn producer_spin_limit(mut self, limit: Option<u64>) -> Self {
        self.producer_spin_limit = limit;
        self
    }

    pub fn build(self) -> Result<TraceBuffer, PatchError> {
        if self.capacity == 0 {
            return Err(PatchError::ZeroCapacity);
        }
        if self.block_sampling_frequency > 1
            && self.block_sampling_offset >= self.block_sampling_frequency
        {
            return Err(PatchError::InvalidSampling {
                offset: self.block_sampling_offset,
                frequency: self.block_sampling_frequency,
            });
        }

        let analysis = self.record_type == RecordType::AddressAnalysis;
        let header = BufferHeader {
            full: AtomicU32::new(0),
            analysis: AtomicU32::new(analysis as u32),
            head_index: AtomicU32::new(0),
            tail_index: AtomicU32::new(0),
            size: self.capacity,
            num_threads: AtomicU32::new(self.num_threads),
            block_sampling_offset: self.block_sampling_offset,
            block_sampling_frequency: self.block_sampling_frequency,
            record_type: self.record_type.to_wire(),
            flags: self.flags.bits(),
        };

        Ok(TraceBuffer {
            header,
            store: RecordStore::new(self.record_type, self.capacity as usize),
            torchview: self.torchview,
            producer_spin_limit: self.producer_spin_limit,
            dropped: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        })
    }
}

impl TraceBuffer {
    pub fn builder(capacity: u32) -> TraceBufferBuilder {
        TraceBufferBuilder::new(capacity)
    }

    // ── Producer side ────────────────────────────────────────────────────

    pub fn samples_block(&self, block_id: u32) -> bool {
        let frequency = self.header.block_sampling_frequency;
        frequency <= 1 || block_id % frequency == self.header.block_sampling_offset
    }

    pub fn captures(&self, flags: AccessFlags) -> bool {
        let mask = AccessFlags::from_wire(self.header.flags);
        mask.is_empty() || mask.intersects(flags)
    }

    /// Append without waiting. Fails with [`AppendError::Full`] while the
    /// host has not drained, and with [`AppendError::Aborted`] once the host
    /// has given up on the launch.
    pub fn try_append<R: TraceRecord>(&self, record: R) -> Result<AppendOutcome, AppendError> {
        if self.is_aborted() {
            return Err(AppendError::Aborted);
        }
        let ring = R::ring(&self.store).ok_or(AppendError::WrongRecordType {
            expected: self.store.record_type(),
            actual: R::TYPE,
        })?;
        let reservation = self.header.reserve().ok_or(AppendError::Full)?;
        ring.publish(reservation.slot as usize, record);
        Ok(AppendOutcome::Queued {
            slot: reservation.slot,
            filled: reservation.filled,
        })
    }

    /// Append, busy-polling while the buffer is full. Gives up once
    /// `backoff` is exhausted; the record is then counted as dropped.
    pub fn append<R: TraceRecord>(
        &self,
        record: R,
        backoff: &Backoff,
    ) -> Result<AppendOutcome, AppendError> {
        loop {
            match self.try_append(record) {
                Err(AppendError::Full) => {
                    if backoff.is_exhausted() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping record after {} polls on a full buffer", backoff.polls());
                        return Err(AppendError::Stalled {
                            polls: backoff.polls(),
                        });
                    }
                    backoff.snooze();
                }
                other => return other,
            }
        }
    }

    /// Handle one group access: sampling and capture filters, TorchView
    /// marking, then either the dictionary (analysis mode) or the queue.
    pub fn record_access(&self, access: &WarpAccess) -> Result<AppendOutcome, AppendError> {
        if !self.samples_block(access.flat_block_id) || !self.captures(access.flags) {
            return Ok(AppendOutcome::Skipped);
        }

        if let Some(torchview) = &self.torchview {
            if !access.flags.is_block_marker() {
                for lane in access.active_lanes() {
                    torchview.touch(access.pc, access.address[lane], access.flags);
                }
            }
        }

        let backoff = self.backoff();
        match &self.store {
            RecordStore::Full(_) => self.append(access.to_full(), &backoff),
            RecordStore::Address(_) => self.append(access.to_address(), &backoff),
            RecordStore::Analysis { dict, .. } => {
                if access.flags.is_block_marker() {
                    return Ok(AppendOutcome::Skipped);
                }
                let (mut hits, mut inserted, mut overflowed) = (0, 0, 0);
                for lane in access.active_lanes() {
                    let range = AddressRange::from_access(access.address[lane], access.size);
                    match dict.update(range, access.flags) {
                        DictUpdate::Hit(_) => hits += 1,
                        DictUpdate::Inserted(_) => inserted += 1,
                        DictUpdate::Overflow => {
                            overflowed += 1;
                            backoff.reset();
                            self.append(range, &backoff)?;
                        }
                    }
                }
                Ok(AppendOutcome::Analyzed {
                    hits,
                    inserted,
                    overflowed,
                })
            }
        }
    }

    /// Mark one producer group finished. Returns the groups still live.
    pub fn finish_group(&self) -> u32 {
        match self
            .header
            .num_threads
            .fetch_update(Ordering::Release, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                debug!("finish_group called with no live producer groups");
                0
            }
        }
    }

    fn backoff(&self) -> Backoff {
        match self.producer_spin_limit {
            Some(limit) => Backoff::with_limit(limit),
            None => Backoff::new(),
        }
    }

    // ── Host side ────────────────────────────────────────────────────────

    /// Copy out every published record from `tail_index` onward, advance
    /// `tail_index` and clear `full`.
    pub fn drain(&self) -> DrainedRecords {
        match &self.store {
            RecordStore::Full(ring) => DrainedRecords::Full(self.drain_ring(ring)),
            RecordStore::Address(ring) => DrainedRecords::Address(self.drain_ring(ring)),
            RecordStore::Analysis { ring, .. } => DrainedRecords::Analysis(self.drain_ring(ring)),
        }
    }

    fn drain_ring<T: Pod>(&self, ring: &RecordRing<T>) -> Vec<T> {
        let size = self.header.size;
        let mut tail = self.header.tail_index.load(Ordering::Acquire);
        let mut out = Vec::new();

        // A slot that is reserved but not yet published ends this drain.
        for _ in 0..size {
            match ring.take(tail as usize) {
                Some(record) => {
                    out.push(record);
                    tail = (tail + 1) % size;
                }
                None => break,
            }
        }

        if !out.is_empty() {
            self.header.tail_index.store(tail, Ordering::SeqCst);
            self.header.full.store(0, Ordering::SeqCst);
        }
        out
    }

    /// Stop accepting records. Producers already waiting on a full buffer
    /// return [`AppendError::Aborted`]; a record whose slot was reserved is
    /// still published, so the host must keep draining until every group
    /// has finished.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.header.full.load(Ordering::Acquire) != 0
    }

    /// True once every producer group has finished.
    pub fn is_complete(&self) -> bool {
        self.live_threads() == 0
    }

    pub fn live_threads(&self) -> u32 {
        self.header.num_threads.load(Ordering::Acquire)
    }

    /// Records waiting between tail and head (estimate while producers run).
    pub fn pending(&self) -> u32 {
        self.header.pending()
    }

    pub fn capacity(&self) -> u32 {
        self.header.size
    }

    pub fn record_type(&self) -> RecordType {
        self.store.record_type()
    }

    pub fn flags(&self) -> AccessFlags {
        AccessFlags::from_wire(self.header.flags)
    }

    pub fn is_analysis(&self) -> bool {
        self.header.analysis.load(Ordering::Acquire) != 0
    }

    /// Records producers gave up on after stalling on a full buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn address_dict(&self) -> Option<&AddressDict> {
        match &self.store {
            RecordStore::Analysis { dict, .. } => Some(dict.as_ref()),
            _ => None,
        }
    }

    pub fn torchview(&self) -> Option<&TorchViewDict> {
        self.torchview.as_ref()
    }

    /// The header as the device sees it right now.
    pub fn raw_header(&self) -> RawBufferHeader {
        self.header.snapshot(
            self.store.device_addr(),
            self.address_dict().map_or(0, |d| d.device_addr()),
            self.torchview.as_ref().map_or(0, |t| t.device_addr()),
        )
    }
}
