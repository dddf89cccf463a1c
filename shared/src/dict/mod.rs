//! Auxiliary on-device structures
//!
//! - [`address`]: fixed-capacity deduplication of accessed address ranges
//! - [`torchview`]: per-instruction read/write bitmaps over host-declared
//!   view ranges

pub mod address;
pub mod torchview;
