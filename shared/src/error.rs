//! Errors raised while setting up protocol structures on the host
//!
//! Producers never see these: every failure a producer can hit is either a
//! sentinel state (dictionary overflow, dropped records) or an
//! [`AppendError`](crate::buffer::AppendError) returned inline.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("unknown record type {0}")]
    UnknownRecordType(u32),

    #[error("invalid address range: start {start:#x} > end {end:#x}")]
    InvalidRange { start: u64, end: u64 },

    #[error("view ranges must be sorted by start (range {index} is out of order)")]
    UnsortedRanges { index: usize },

    #[error("view range {index} overlaps its predecessor")]
    OverlappingRanges { index: usize },

    #[error("buffer capacity must be at least one record")]
    ZeroCapacity,

    #[error("block sampling offset {offset} must be below frequency {frequency}")]
    InvalidSampling { offset: u32, frequency: u32 },

    #[error("TorchView table of {views} views x {rows} rows does not fit the device layout")]
    ViewTableTooLarge { views: usize, rows: usize },

    #[error("TorchView dictionary needs at least one instruction row")]
    NoInstructionRows,

    #[error("wire protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
}
