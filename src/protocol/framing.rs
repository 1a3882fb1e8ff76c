//! Length-prefixed frames.
//!
//! Layout of one frame:
//!
//! ```text
//! +----------------+-----------------+---------+
//! | length (u32 BE)| payload         | trailer |
//! +----------------+-----------------+---------+
//! ```
//!
//! `length` counts payload bytes only. The trailer is the payload's
//! [`FrameCheck`]: one [`checksum8`] byte by default, or a CRC-16/MODBUS
//! value sent low byte first.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::crc::{checksum8, crc16_modbus};
use crate::error::{Error, Result};

/// Bytes of the length prefix.
const HEADER_LEN: usize = 4;

/// Bytes of framing around each payload with the default check.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 1;

/// Default limit on accepted payload length.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Integrity check carried in a frame's trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameCheck {
    /// 8-bit additive checksum.
    #[default]
    Sum8,
    /// CRC-16/MODBUS, low byte first.
    Crc16,
}

impl FrameCheck {
    /// Size of the trailer in bytes.
    pub fn trailer_len(&self) -> usize {
        match self {
            Self::Sum8 => 1,
            Self::Crc16 => 2,
        }
    }

    fn put(&self, payload: &[u8], frame: &mut BytesMut) {
        match self {
            Self::Sum8 => frame.put_u8(checksum8(payload)),
            Self::Crc16 => frame.put_u16_le(crc16_modbus(payload)),
        }
    }

    fn verify(&self, payload: &[u8], trailer: &mut BytesMut) -> Result<()> {
        let (expected, actual) = match self {
            Self::Sum8 => (u16::from(checksum8(payload)), u16::from(trailer.get_u8())),
            Self::Crc16 => (crc16_modbus(payload), trailer.get_u16_le()),
        };

        if expected != actual {
            return Err(Error::InvalidFrame {
                context: format!(
                    "{:?} mismatch: expected {:#06x}, got {:#06x}",
                    self, expected, actual
                ),
            });
        }
        Ok(())
    }
}

/// Frame a payload with the default check.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    encode_frame_with(payload, FrameCheck::default())
}

/// Frame a payload with `check` as the trailer.
pub fn encode_frame_with(payload: &[u8], check: FrameCheck) -> Result<Bytes> {
    let length = u32::try_from(payload.len()).map_err(|_| Error::InvalidFrame {
        context: format!("payload of {} bytes is too long", payload.len()),
    })?;

    let mut frame = BytesMut::with_capacity(payload.len() + HEADER_LEN + check.trailer_len());
    frame.put_u32(length);
    frame.put_slice(payload);
    check.put(payload, &mut frame);
    Ok(frame.freeze())
}

/// Decode exactly one complete frame with the default check.
///
/// # Errors
///
/// Returns [`Error::InvalidFrame`] if `frame` is truncated, has trailing
/// bytes or fails its checksum.
pub fn decode_frame(frame: &[u8]) -> Result<Bytes> {
    let mut decoder = FrameDecoder::new(usize::MAX);
    decoder.extend(frame);
    match decoder.decode()? {
        Some(payload) if decoder.buffered() == 0 => Ok(payload),
        Some(_) => Err(Error::InvalidFrame {
            context: format!("{} trailing bytes", decoder.buffered()),
        }),
        None => Err(Error::InvalidFrame {
            context: format!("truncated frame of {} bytes", frame.len()),
        }),
    }
}

/// Incremental decoder for a stream of frames.
///
/// Feed received bytes with [`extend`](Self::extend) and pull complete
/// payloads with [`decode`](Self::decode). Partial frames stay buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
    check: FrameCheck,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    /// Create a decoder for the default check, rejecting payloads longer
    /// than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self::with_check(max_frame_len, FrameCheck::default())
    }

    /// Create a decoder expecting `check` trailers.
    pub fn with_check(max_frame_len: usize, check: FrameCheck) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
            check,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered and not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete payload, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] for an oversized length or a checksum
    /// mismatch. The offending frame is discarded so decoding can continue.
    pub fn decode(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if length > self.max_frame_len {
            self.buffer.clear();
            return Err(Error::InvalidFrame {
                context: format!(
                    "length {} exceeds limit of {} bytes",
                    length, self.max_frame_len
                ),
            });
        }

        let total = length
            .saturating_add(HEADER_LEN)
            .saturating_add(self.check.trailer_len());
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(length).freeze();
        self.check.verify(&payload, &mut self.buffer)?;

        Ok(Some(payload))
    }
}
