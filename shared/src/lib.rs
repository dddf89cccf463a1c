//! Shared types for the gpu-patch trace protocol
//!
//! This crate holds everything both sides of the producer/consumer boundary
//! must agree on: the fixed record layouts, the trace buffer control block,
//! the address dictionary and the TorchView range bitmaps, plus the framing
//! used to ship drained records to an analyzer.

pub mod buffer;
pub mod dict;
pub mod error;
pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use buffer::{
    AppendError, AppendOutcome, Backoff, DrainedRecords, TraceBuffer, TraceBufferBuilder, TraceRecord,
};
pub use dict::address::{AddressDict, DictEntry, DictUpdate};
pub use dict::torchview::{TorchViewDict, TouchOutcome};
pub use error::PatchError;
pub use types::{flags::*, range::AddressRange, record::*};
