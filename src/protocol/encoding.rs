//! Text encodings for binary payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{Error, Result};

/// Lower-case hex, two digits per byte.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Parse hex in either case. Whitespace between digits is ignored.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] for odd-length input or non-hex digits.
pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.split_whitespace().collect();
    hex::decode(digits).map_err(|e| Error::InvalidEncoding {
        context: format!("hex: {}", e),
    })
}

/// Standard padded base64.
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Parse standard padded base64.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if `text` is not valid base64.
pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| Error::InvalidEncoding {
            context: format!("base64: {}", e),
        })
}
