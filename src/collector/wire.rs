//! Framing for inventory reports sent over a byte stream.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Magic: "TSHM" (4 bytes)              │
//! │ Version: u16                         │
//! │ Flags: u16 (reserved, 0)             │
//! │ Payload length: u32 (LE)             │
//! │ Checksum: u32 (CRC32 of payload)     │
//! ├──────────────────────────────────────┤
//! │ Payload (rkyv-serialized report)     │
//! └──────────────────────────────────────┘
//! ```

use super::InventoryReport;
use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Frame magic bytes.
const MAGIC: [u8; 4] = *b"TSHM";

/// Frame format version.
const VERSION: u16 = 1;

/// Largest payload accepted by [`read_report`].
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = FrameHeader::SIZE;

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    magic: [u8; 4],
    version: u16,
    flags: u16,
    payload_len: u32,
    checksum: u32,
}

impl FrameHeader {
    const SIZE: usize = 4 + 2 + 2 + 4 + 4;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            version: u16::from_le_bytes([buf[4], buf[5]]),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            payload_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            checksum: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Publish(format!("invalid frame magic: {:?}", self.magic)));
        }
        if self.version != VERSION {
            return Err(Error::Publish(format!(
                "unsupported frame version: {}",
                self.version
            )));
        }
        if self.payload_len as usize > MAX_PAYLOAD {
            return Err(Error::Publish(format!(
                "frame payload of {} bytes exceeds the limit",
                self.payload_len
            )));
        }
        Ok(())
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// Serialize `report` into a single frame.
pub fn encode_report(report: &InventoryReport) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(report)
        .map_err(|e| Error::Publish(format!("failed to serialize report: {e}")))?;
    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_PAYLOAD)
        .ok_or_else(|| Error::Publish(format!("report of {} bytes is too large", payload.len())))?;

    let header = FrameHeader {
        magic: MAGIC,
        version: VERSION,
        flags: 0,
        payload_len,
        checksum: crc32(&payload),
    };

    let mut frame = Vec::with_capacity(FrameHeader::SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse one complete frame produced by [`encode_report`].
pub fn decode_report(frame: &[u8]) -> Result<InventoryReport> {
    let Some((head, payload)) = frame.split_first_chunk::<{ FrameHeader::SIZE }>() else {
        return Err(Error::Publish("frame shorter than its header".into()));
    };
    let header = FrameHeader::from_bytes(head);
    header.validate()?;
    if payload.len() != header.payload_len as usize {
        return Err(Error::Publish(format!(
            "frame declares {} payload bytes, found {}",
            header.payload_len,
            payload.len()
        )));
    }
    decode_payload(&header, payload)
}

fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<InventoryReport> {
    if crc32(payload) != header.checksum {
        return Err(Error::Publish("frame checksum mismatch".into()));
    }

    // rkyv needs an aligned buffer
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<InventoryReport, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Publish(format!("failed to deserialize report: {e}")))
}

/// Write `report` as one frame.
pub fn write_report<W: Write>(writer: &mut W, report: &InventoryReport) -> Result<()> {
    writer.write_all(&encode_report(report)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from `reader`.
pub fn read_report<R: Read>(reader: &mut R) -> Result<InventoryReport> {
    let mut head = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut head)?;
    let header = FrameHeader::from_bytes(&head);
    header.validate()?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload)?;
    decode_payload(&header, &payload)
}
