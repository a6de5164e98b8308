//! Encode side of the export-stream wire format.
//!
//! Produces byte streams the [`StreamParser`](super::StreamParser) decodes:
//! a run of sync bytes, then records of little-endian address, byte count,
//! and 16-bit values at consecutive addresses. Used by tests and by stream
//! generators standing in for the simulator.

use byteorder::{ByteOrder, LittleEndian};

use super::{FRAME_SYNC_ADDRESS, NOOP_ADDRESS, SYNC_BYTE, SYNC_RUN};
use crate::error::{ProtocolError, Result};

/// Builds one export frame: sync run, records, end-of-frame record.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame with the standard sync run.
    pub fn new() -> Self {
        Self {
            bytes: vec![SYNC_BYTE; usize::from(SYNC_RUN)],
        }
    }

    /// Append a record of consecutive 16-bit values starting at `address`.
    ///
    /// The reserved addresses (`0x5555`, `0xfffe`) cannot be written; the
    /// encoder is where that invariant is enforced.
    pub fn write(mut self, address: u16, values: &[u16]) -> Result<Self> {
        if address == NOOP_ADDRESS || address == FRAME_SYNC_ADDRESS {
            return Err(ProtocolError::ReservedAddress(address).into());
        }
        let count = values.len() * 2;
        if count > usize::from(u16::MAX) {
            return Err(ProtocolError::PayloadTooLarge {
                size: count,
                max: usize::from(u16::MAX),
            }
            .into());
        }

        let mut header = [0u8; 4];
        LittleEndian::write_u16(&mut header[0..2], address);
        LittleEndian::write_u16(&mut header[2..4], count as u16);
        self.bytes.extend_from_slice(&header);

        for &value in values {
            let mut word = [0u8; 2];
            LittleEndian::write_u16(&mut word, value);
            self.bytes.extend_from_slice(&word);
        }
        Ok(self)
    }

    /// Terminate the frame with the end-of-frame record (dummy word; the
    /// parser ignores its value) and return the encoded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let mut trailer = [0u8; 6];
        LittleEndian::write_u16(&mut trailer[0..2], FRAME_SYNC_ADDRESS);
        LittleEndian::write_u16(&mut trailer[2..4], 2);
        self.bytes.extend_from_slice(&trailer);
        self.bytes
    }

    /// Return the encoded bytes without an end-of-frame record.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
