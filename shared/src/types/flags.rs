//! Access-kind flags and record type discriminators

use crate::error::PatchError;
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Kind of memory access carried by a record, and the capture mask of a
    /// buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        /// System-scope atomic
        const ATOMSYS = 0x4;
        const LOCAL = 0x8;
        const SHARED = 0x10;
        const BLOCK_ENTER = 0x20;
        const BLOCK_EXIT = 0x40;
        const ANALYSIS = 0x80;
    }
}

impl AccessFlags {
    /// Decode from the wire, keeping bits this build doesn't know about.
    pub fn from_wire(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    /// True for the block enter/exit markers.
    pub fn is_block_marker(&self) -> bool {
        self.intersects(Self::BLOCK_ENTER | Self::BLOCK_EXIT)
    }
}

impl std::str::FromStr for AccessFlags {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AccessFlags::empty()),
            "read" => Ok(AccessFlags::READ),
            "write" => Ok(AccessFlags::WRITE),
            "atomsys" | "atomic" => Ok(AccessFlags::ATOMSYS),
            "local" => Ok(AccessFlags::LOCAL),
            "shared" => Ok(AccessFlags::SHARED),
            "block_enter" => Ok(AccessFlags::BLOCK_ENTER),
            "block_exit" => Ok(AccessFlags::BLOCK_EXIT),
            "analysis" => Ok(AccessFlags::ANALYSIS),
            _ => anyhow::bail!("Invalid access flag: {}", s),
        }
    }
}

/// Which record encoding a buffer stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum RecordType {
    /// Full record with per-lane values
    #[default]
    Full = 0,
    /// Addresses only
    Address = 1,
    /// On-device analysis; only dictionary overflow ranges are queued
    AddressAnalysis = 2,
}

impl RecordType {
    /// Number of record types defined by the protocol
    pub const COUNT: u32 = 3;

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Full => "full",
            RecordType::Address => "address",
            RecordType::AddressAnalysis => "address_analysis",
        }
    }
}

impl TryFrom<u32> for RecordType {
    type Error = PatchError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RecordType::Full),
            1 => Ok(RecordType::Address),
            2 => Ok(RecordType::AddressAnalysis),
            other => Err(PatchError::UnknownRecordType(other)),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" | "default" => Ok(RecordType::Full),
            "address" => Ok(RecordType::Address),
            "analysis" | "address_analysis" => Ok(RecordType::AddressAnalysis),
            _ => anyhow::bail!("Invalid record type: {}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_match_wire() {
        assert_eq!(AccessFlags::READ.bits(), 0x1);
        assert_eq!(AccessFlags::WRITE.bits(), 0x2);
        assert_eq!(AccessFlags::SHARED.bits(), 0x10);
        assert_eq!(AccessFlags::ANALYSIS.bits(), 0x80);
    }

    #[test]
    fn test_unknown_bits_retained() {
        let flags = AccessFlags::from_wire(0x101);
        assert!(flags.contains(AccessFlags::READ));
        assert_eq!(flags.bits(), 0x101);
    }

    #[test]
    fn test_record_type_decode() {
        assert_eq!(RecordType::try_from(1).unwrap(), RecordType::Address);
        assert_eq!(
            RecordType::try_from(RecordType::COUNT),
            Err(PatchError::UnknownRecordType(3))
        );
        assert_eq!("analysis".parse::<RecordType>().unwrap(), RecordType::AddressAnalysis);
        assert!("bogus".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_parse_flags() {
        let flags: AccessFlags = "Write".parse().unwrap();
        assert_eq!(flags, AccessFlags::WRITE);
        assert!(AccessFlags::BLOCK_EXIT.is_block_marker());
        assert!(!AccessFlags::READ.is_block_marker());
    }

    #[test]
    fn test_record_type_names() {
        assert_eq!(
            serde_json::to_string(&RecordType::AddressAnalysis).unwrap(),
            "\"address_analysis\""
        );
        for ty in [RecordType::Full, RecordType::Address, RecordType::AddressAnalysis] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json.trim_matches('"'), ty.as_str());
        }
    }
}
