//! Hex codec for operator-entered payloads and log output.
//!
//! Pin maps, driver ids and raw console commands are exchanged with the
//! operator as hex strings; every outbound frame is logged as hex.
//!
//! # Example
//!
//! ```
//! use epd_link::codec::HexCodec;
//!
//! let bytes = HexCodec::decode("0501ff").unwrap();
//! assert_eq!(bytes, vec![0x05, 0x01, 0xff]);
//! assert_eq!(HexCodec::encode(&bytes), "0501ff");
//! ```

use crate::error::{EpdError, Result};

const DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex encoder/decoder.
pub struct HexCodec;

impl HexCodec {
    /// Encode bytes as lowercase hex, two digits per byte.
    pub fn encode(data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len() * 2);
        for &b in data {
            out.push(DIGITS[(b >> 4) as usize] as char);
            out.push(DIGITS[(b & 0x0f) as usize] as char);
        }
        out
    }

    /// Decode a hex string. Surrounding whitespace is ignored, case is not
    /// significant.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` on odd length or a non-hex digit.
    pub fn decode(text: &str) -> Result<Vec<u8>> {
        let text = text.trim().as_bytes();
        if text.len() % 2 != 0 {
            return Err(EpdError::InvalidPayload(format!(
                "hex string has odd length {}",
                text.len()
            )));
        }

        text.chunks_exact(2)
            .enumerate()
            .map(|(i, pair)| {
                let hi = nibble(pair[0]).ok_or_else(|| bad_digit(pair[0], i * 2))?;
                let lo = nibble(pair[1]).ok_or_else(|| bad_digit(pair[1], i * 2 + 1))?;
                Ok((hi << 4) | lo)
            })
            .collect()
    }
}

#[inline]
fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn bad_digit(c: u8, pos: usize) -> EpdError {
    EpdError::InvalidPayload(format!(
        "invalid hex digit {:?} at position {}",
        c as char, pos
    ))
}
