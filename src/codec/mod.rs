//! Codec module - text encodings for payloads.
//!
//! - [`HexCodec`] - hex strings used by the operator console, pin maps and logs
//!
//! Image payloads are never interpreted here; they are opaque bytes produced
//! by the caller's pixel encoder.

mod hex;

pub use hex::HexCodec;
