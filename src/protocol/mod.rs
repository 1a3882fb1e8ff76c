//! Application-level framing helpers.
//!
//! The manager moves raw bytes and owns no wire format. These helpers are
//! for applications that want message boundaries on top of a connection:
//! length-prefixed frames checked with an additive checksum or CRC-16/MODBUS,
//! and hex and base64 text encodings of binary payloads.

pub mod crc;
pub mod encoding;
pub mod framing;

pub use crc::{checksum8, crc16_modbus};
pub use encoding::{decode_base64, decode_hex, encode_base64, encode_hex};
pub use framing::{decode_frame, encode_frame, encode_frame_with, FrameCheck, FrameDecoder};
