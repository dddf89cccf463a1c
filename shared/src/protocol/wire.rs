//! Drained batch encoding
//!
//! Uses bincode with an explicit config (fixint for lengths and enum tags)
//! so writer and reader always agree on the encoding. The record enum tag is
//! the only format discriminator, the same way `type` is the only one in
//! the device buffer.
//!
//! A stream is a sequence of frames: a little-endian `u32` payload length
//! followed by one encoded [`TraceBatch`].

use crate::buffer::DrainedRecords;
use crate::error::PatchError;
use anyhow::{Context, Result};
use bincode::Options;
use std::io::{ErrorKind, Read, Write};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame, to reject corrupt length prefixes.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

fn wire_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// One drain's worth of records
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TraceBatch {
    pub version: u32,
    pub sequence: u64,
    pub drained_at_ns: u64,
    pub records: DrainedRecords,
}

impl TraceBatch {
    pub fn new(sequence: u64, drained_at_ns: u64, records: DrainedRecords) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            drained_at_ns,
            records,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        wire_bincode().serialize(self).map_err(Into::into)
    }

    /// Decode a batch, validating the protocol version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let batch: Self = wire_bincode()
            .deserialize(bytes)
            .context("failed to decode trace batch")?;
        if batch.version != PROTOCOL_VERSION {
            return Err(PatchError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: batch.version,
            }
            .into());
        }
        Ok(batch)
    }
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, batch: &TraceBatch) -> Result<()> {
    let payload = batch.to_bytes()?;
    let len = u32::try_from(payload.len()).context("trace batch too large for a frame")?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Read the next frame. `Ok(None)` at a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<TraceBatch>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame length {} exceeds limit {}", len, MAX_FRAME_BYTES);
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .context("truncated trace frame")?;
    TraceBatch::from_bytes(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::flags::AccessFlags;
    use crate::types::range::AddressRange;
    use crate::types::record::WarpAccess;

    #[test]
    fn test_frames_stream() {
        let full = WarpAccess::new(0x80, AccessFlags::READ, 8)
            .with_lane(5, 0xbeef, &[1; 8])
            .to_full();
        let batches = vec![
            TraceBatch::new(1, 100, DrainedRecords::Full(vec![full])),
            TraceBatch::new(2, 200, DrainedRecords::Analysis(vec![AddressRange { start: 4, end: 8 }])),
        ];

        let mut stream = Vec::new();
        for batch in &batches {
            write_frame(&mut stream, batch).unwrap();
        }

        let mut cursor = std::io::Cursor::new(stream);
        let mut decoded = Vec::new();
        while let Some(batch) = read_frame(&mut cursor).unwrap() {
            decoded.push(batch);
        }
        assert_eq!(decoded, batches);
    }

    #[test]
    fn test_enum_tag_leads_records() {
        let batch = TraceBatch::new(9, 0, DrainedRecords::Address(vec![]));
        let bytes = batch.to_bytes().unwrap();
        // version (4) + sequence (8) + drained_at_ns (8), then the tag
        assert_eq!(bytes[0..4], [1, 0, 0, 0]);
        assert_eq!(bytes[20..24], [1, 0, 0, 0]);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut batch = TraceBatch::new(1, 0, DrainedRecords::Analysis(vec![]));
        batch.version = 99;
        let bytes = wire_bincode().serialize(&batch).unwrap();
        let err = TraceBatch::from_bytes(&bytes).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PatchError>(),
            Some(&PatchError::VersionMismatch { expected: 1, actual: 99 })
        );
    }

    #[test]
    fn test_garbage_bytes_fail() {
        assert!(TraceBatch::from_bytes(&[0xFF; 20]).is_err());

        let mut cursor = std::io::Cursor::new(vec![0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(read_frame(&mut cursor).is_err());
    }
}
