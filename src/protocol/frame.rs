//! Command frames.
//!
//! A frame is one opcode byte followed by the payload, sent as a single
//! transport write. There is no length field.
//!
//! # Example
//!
//! ```
//! use epd_link::protocol::{encode_frame, FramePayload, Opcode};
//!
//! let frame = encode_frame(Opcode::SetPins, FramePayload::Hex("0102030405060708")).unwrap();
//! assert_eq!(frame[0], 0x00);
//! assert_eq!(frame.len(), 9);
//!
//! let init = encode_frame(Opcode::Init, FramePayload::Empty).unwrap();
//! assert_eq!(&init[..], &[0x01]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::opcode::Opcode;
use crate::codec::HexCodec;
use crate::error::{EpdError, Result};

/// Payload forms accepted by the encoder.
#[derive(Debug, Clone, Copy)]
pub enum FramePayload<'a> {
    /// No payload.
    Empty,
    /// Raw bytes.
    Bytes(&'a [u8]),
    /// Hex string, two digits per byte.
    Hex(&'a str),
    /// Integer values; each must fit in 0..=255.
    Values(&'a [i32]),
}

impl<'a> FramePayload<'a> {
    /// Resolve the payload to raw bytes, validating as it goes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match *self {
            FramePayload::Empty => Ok(Vec::new()),
            FramePayload::Bytes(b) => Ok(b.to_vec()),
            FramePayload::Hex(s) => HexCodec::decode(s),
            FramePayload::Values(values) => values
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    u8::try_from(v).map_err(|_| {
                        EpdError::InvalidPayload(format!(
                            "value {} at index {} is outside 0..=255",
                            v, i
                        ))
                    })
                })
                .collect(),
        }
    }
}

impl<'a> From<&'a [u8]> for FramePayload<'a> {
    fn from(b: &'a [u8]) -> Self {
        FramePayload::Bytes(b)
    }
}

impl<'a> From<&'a Vec<u8>> for FramePayload<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        FramePayload::Bytes(b)
    }
}

impl<'a> From<&'a str> for FramePayload<'a> {
    fn from(s: &'a str) -> Self {
        FramePayload::Hex(s)
    }
}

/// A device command ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    payload: Bytes,
}

impl Command {
    /// Command with a raw payload.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Command with no payload.
    pub fn empty(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: Bytes::new(),
        }
    }

    /// Command from any accepted payload form.
    pub fn with_payload(opcode: Opcode, payload: FramePayload<'_>) -> Result<Self> {
        Ok(Self::new(opcode, payload.to_bytes()?))
    }

    /// Parse an operator console line: first byte is the opcode, the rest
    /// is payload. Returns `None` for a blank line.
    pub fn from_hex_line(line: &str) -> Result<Option<Self>> {
        let bytes = HexCodec::decode(line)?;
        let Some((&first, rest)) = bytes.split_first() else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(first)?;
        Ok(Some(Self::new(opcode, Bytes::copy_from_slice(rest))))
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded frame length.
    #[inline]
    pub fn frame_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Encode to the wire frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        buf.put_u8(self.opcode.as_u8());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Encode an opcode and payload into a single frame.
///
/// # Errors
///
/// Returns `InvalidPayload` if a hex payload is malformed or an integer value
/// is outside the byte range. Nothing is truncated or wrapped.
pub fn encode_frame(opcode: Opcode, payload: FramePayload<'_>) -> Result<Bytes> {
    Ok(Command::with_payload(opcode, payload)?.encode())
}

/// Build an image chunk frame: `WRITE_IMG | tag | data`.
pub fn build_image_chunk(tag: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(Opcode::WriteImg.as_u8());
    buf.put_u8(tag);
    buf.extend_from_slice(data);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_is_opcode_only() {
        let frame = encode_frame(Opcode::Refresh, FramePayload::Empty).unwrap();
        assert_eq!(&frame[..], &[0x05]);
    }

    #[test]
    fn test_bytes_payload_prepends_opcode() {
        let frame = encode_frame(Opcode::SendData, FramePayload::Bytes(&[1, 2, 3])).unwrap();
        assert_eq!(&frame[..], &[0x04, 1, 2, 3]);
    }

    #[test]
    fn test_hex_payload() {
        let frame = encode_frame(Opcode::Init, "0A".into()).unwrap();
        assert_eq!(&frame[..], &[0x01, 0x0a]);
    }

    #[test]
    fn test_bad_hex_rejected() {
        let result = encode_frame(Opcode::SetPins, FramePayload::Hex("zz"));
        assert!(matches!(result, Err(EpdError::InvalidPayload(_))));
    }

    #[test]
    fn test_values_in_range() {
        let frame = encode_frame(Opcode::SetConfig, FramePayload::Values(&[0, 128, 255])).unwrap();
        assert_eq!(&frame[..], &[0x90, 0, 128, 255]);
    }

    #[test]
    fn test_values_out_of_range_rejected_not_wrapped() {
        let err = encode_frame(Opcode::SetConfig, FramePayload::Values(&[1, 256])).unwrap_err();
        assert!(err.to_string().contains("index 1"));

        let err = encode_frame(Opcode::SetConfig, FramePayload::Values(&[-1])).unwrap_err();
        assert!(matches!(err, EpdError::InvalidPayload(_)));
    }

    #[test]
    fn test_from_hex_line() {
        let cmd = Command::from_hex_line("0501").unwrap().unwrap();
        assert_eq!(cmd.opcode(), Opcode::Refresh);
        assert_eq!(cmd.payload(), &[0x01]);

        let cmd = Command::from_hex_line("02").unwrap().unwrap();
        assert_eq!(cmd.opcode(), Opcode::Clear);
        assert!(cmd.payload().is_empty());
    }

    #[test]
    fn test_from_hex_line_blank() {
        assert!(Command::from_hex_line("   ").unwrap().is_none());
    }

    #[test]
    fn test_from_hex_line_unknown_opcode() {
        assert!(matches!(
            Command::from_hex_line("7700"),
            Err(EpdError::UnknownOpcode(0x77))
        ));
    }

    #[test]
    fn test_image_chunk_layout() {
        let frame = build_image_chunk(0xFF, &[9, 8, 7]);
        assert_eq!(&frame[..], &[0x30, 0xFF, 9, 8, 7]);
    }

    #[test]
    fn test_command_frame_len() {
        let cmd = Command::new(Opcode::SetTime, vec![0u8; 6]);
        assert_eq!(cmd.frame_len(), 7);
        assert_eq!(cmd.encode().len(), 7);
    }
}
