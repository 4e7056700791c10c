//! Protocol module - command opcodes, frame encoding and typed payloads.
//!
//! - One opcode byte + payload per transport write
//! - `WRITE_IMG` chunks carry a plane/continuation tag byte
//! - `SET_TIME` carries a fixed 6-byte payload

mod driver;
mod frame;
mod opcode;
mod time_sync;

pub use driver::{ColorMode, DriverModel, DRIVERS};
pub use frame::{build_image_chunk, encode_frame, Command, FramePayload};
pub use opcode::{tag, Opcode, CHUNK_OVERHEAD};
pub use time_sync::{ClockMode, TimeSync, TIME_SYNC_LEN};
