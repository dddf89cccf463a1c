//! Trace record layouts
//!
//! Both records mirror the C structs field for field. The explicit `_pad`
//! words make the implicit C padding visible so the types are `Pod` and can
//! be copied in and out of device memory as raw bytes.

use super::flags::AccessFlags;
use super::{MAX_ACCESS_SIZE, WARP_SIZE};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Per-lane value payload
pub type LaneValue = [u8; MAX_ACCESS_SIZE];

/// Full record: one group memory instruction with addresses and values.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct PatchRecord {
    pub pc: u64,
    pub size: u32,
    pub active: u32,
    pub flat_thread_id: u32,
    pub flat_block_id: u32,
    pub flags: u32,
    pub _pad: u32,
    pub address: [u64; WARP_SIZE],
    pub value: [LaneValue; WARP_SIZE],
}

static_assertions::const_assert_eq!(std::mem::size_of::<PatchRecord>(), 800);

/// Address-only record. Field order differs from [`PatchRecord`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct AddressRecord {
    pub pc: u64,
    pub flags: u32,
    pub active: u32,
    pub size: u32,
    pub _pad: u32,
    pub address: [u64; WARP_SIZE],
}

static_assertions::const_assert_eq!(std::mem::size_of::<AddressRecord>(), 280);

/// Iterate the lane indices set in an active mask.
pub fn active_lanes(active: u32) -> impl Iterator<Item = usize> {
    (0..WARP_SIZE).filter(move |lane| active & (1 << lane) != 0)
}

impl PatchRecord {
    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from_wire(self.flags)
    }

    pub fn active_lanes(&self) -> impl Iterator<Item = usize> {
        active_lanes(self.active)
    }

    /// The bytes actually accessed by `lane`.
    pub fn lane_value(&self, lane: usize) -> &[u8] {
        let len = (self.size as usize).min(MAX_ACCESS_SIZE);
        &self.value[lane][..len]
    }
}

impl AddressRecord {
    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from_wire(self.flags)
    }

    pub fn active_lanes(&self) -> impl Iterator<Item = usize> {
        active_lanes(self.active)
    }
}

/// One synchronized group access as seen by the producer, before it is
/// encoded into whichever record the buffer stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpAccess {
    pub pc: u64,
    pub size: u32,
    pub active: u32,
    pub flat_thread_id: u32,
    pub flat_block_id: u32,
    pub flags: AccessFlags,
    pub address: [u64; WARP_SIZE],
    pub value: [LaneValue; WARP_SIZE],
}

impl WarpAccess {
    /// An access with no active lanes yet.
    pub fn new(pc: u64, flags: AccessFlags, size: u32) -> Self {
        Self {
            pc,
            size,
            active: 0,
            flat_thread_id: 0,
            flat_block_id: 0,
            flags,
            address: [0; WARP_SIZE],
            value: [[0; MAX_ACCESS_SIZE]; WARP_SIZE],
        }
    }

    pub fn with_ids(mut self, flat_thread_id: u32, flat_block_id: u32) -> Self {
        self.flat_thread_id = flat_thread_id;
        self.flat_block_id = flat_block_id;
        self
    }

    /// Mark `lane` active with its address and value. Values longer than the
    /// per-lane payload are truncated.
    pub fn with_lane(mut self, lane: usize, address: u64, value: &[u8]) -> Self {
        debug_assert!(lane < WARP_SIZE);
        self.active |= 1 << lane;
        self.address[lane] = address;
        let len = value.len().min(MAX_ACCESS_SIZE);
        self.value[lane][..len].copy_from_slice(&value[..len]);
        self
    }

    pub fn active_lanes(&self) -> impl Iterator<Item = usize> {
        active_lanes(self.active)
    }

    pub fn to_full(&self) -> PatchRecord {
        PatchRecord {
            pc: self.pc,
            size: self.size,
            active: self.active,
            flat_thread_id: self.flat_thread_id,
            flat_block_id: self.flat_block_id,
            flags: self.flags.bits(),
            _pad: 0,
            address: self.address,
            value: self.value,
        }
    }

    pub fn to_address(&self) -> AddressRecord {
        AddressRecord {
            pc: self.pc,
            flags: self.flags.bits(),
            active: self.active,
            size: self.size,
            _pad: 0,
            address: self.address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_full_record_layout() {
        assert_eq!(offset_of!(PatchRecord, pc), 0);
        assert_eq!(offset_of!(PatchRecord, size), 8);
        assert_eq!(offset_of!(PatchRecord, active), 12);
        assert_eq!(offset_of!(PatchRecord, flat_thread_id), 16);
        assert_eq!(offset_of!(PatchRecord, flat_block_id), 20);
        assert_eq!(offset_of!(PatchRecord, flags), 24);
        assert_eq!(offset_of!(PatchRecord, address), 32);
        assert_eq!(offset_of!(PatchRecord, value), 288);
    }

    #[test]
    fn test_address_record_layout() {
        assert_eq!(offset_of!(AddressRecord, flags), 8);
        assert_eq!(offset_of!(AddressRecord, active), 12);
        assert_eq!(offset_of!(AddressRecord, size), 16);
        assert_eq!(offset_of!(AddressRecord, address), 24);
    }

    #[test]
    fn test_encode_full_and_address() {
        let access = WarpAccess::new(0x7f00, AccessFlags::WRITE | AccessFlags::SHARED, 4)
            .with_ids(64, 2)
            .with_lane(0, 0x1000, &[1, 2, 3, 4])
            .with_lane(31, 0x107c, &[9, 9, 9, 9]);

        let full = access.to_full();
        assert_eq!(full.active, 0x8000_0001);
        assert_eq!(full.flat_block_id, 2);
        assert_eq!(full.lane_value(0), &[1, 2, 3, 4]);
        assert_eq!(full.active_lanes().collect::<Vec<_>>(), vec![0, 31]);
        assert!(full.access_flags().contains(AccessFlags::SHARED));

        let addr = access.to_address();
        assert_eq!(addr.address[31], 0x107c);
        assert_eq!(addr.size, 4);
        assert_eq!(addr.flags, 0x12);
    }

    #[test]
    fn test_oversized_value_truncated() {
        let access = WarpAccess::new(0, AccessFlags::READ, 32).with_lane(3, 0x10, &[7u8; 32]);
        let full = access.to_full();
        assert_eq!(full.lane_value(3).len(), MAX_ACCESS_SIZE);
        assert!(full.lane_value(3).iter().all(|b| *b == 7));
    }

    #[test]
    fn test_record_bytes_are_plain() {
        let record = WarpAccess::new(0x10, AccessFlags::READ, 8)
            .with_lane(1, 0xdead_beef, &[0xaa; 8])
            .to_full();
        let bytes = bytemuck::bytes_of(&record);
        assert_eq!(bytes.len(), 800);
        assert_eq!(&bytes[0..8], &0x10u64.to_le_bytes());
        let back: PatchRecord = *bytemuck::from_bytes(bytes);
        assert_eq!(back, record);
    }
}
