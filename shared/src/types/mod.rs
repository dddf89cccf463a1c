//! Protocol type definitions
//!
//! Fixed-layout values shared byte-for-byte between the producer domain and
//! the host.

pub mod flags;
pub mod range;
pub mod record;

/// Lanes per execution group
pub const WARP_SIZE: usize = 32;

/// Widest per-lane access captured in a full record (STS.128)
pub const MAX_ACCESS_SIZE: usize = 16;

/// Address dictionary capacity
pub const ADDRESS_DICT_SIZE: usize = 1024;

/// Bytes per instruction when mapping a pc to a TorchView bitmap row
pub const PC_STRIDE: u64 = 8;

/// Bits per bitmap word
pub const BITMAP_WORD_BITS: usize = 64;
