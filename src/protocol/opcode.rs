//! Command opcodes and image chunk tag bits.
//!
//! Every frame starts with one opcode byte:
//! ```text
//! ┌────────┬──────────────────────────┐
//! │ Opcode │ Payload                  │
//! │ 1 byte │ 0..(mtu - 1) bytes       │
//! └────────┴──────────────────────────┘
//! ```
//!
//! `WRITE_IMG` payloads start with a tag byte (see [`tag`]).

use crate::error::EpdError;

/// Bytes of every image chunk frame that are not image data (opcode + tag).
pub const CHUNK_OVERHEAD: usize = 2;

/// Device command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Load the pin mapping.
    SetPins = 0x00,
    /// Initialise the panel driver (optionally selecting a driver id).
    Init = 0x01,
    /// Clear the screen.
    Clear = 0x02,
    /// Pass a raw command byte to the panel controller.
    SendCmd = 0x03,
    /// Pass raw data bytes to the panel controller.
    SendData = 0x04,
    /// Refresh the panel from its RAM.
    Refresh = 0x05,
    /// Put the panel into deep sleep.
    Sleep = 0x06,
    /// Set wall-clock time, timezone and display mode.
    SetTime = 0x20,
    /// Write one image chunk.
    WriteImg = 0x30,
    /// Store runtime configuration.
    SetConfig = 0x90,
    /// Reset the peripheral.
    SysReset = 0x91,
    /// Put the peripheral into system sleep.
    SysSleep = 0x92,
    /// Erase stored configuration.
    CfgErase = 0x99,
}

impl Opcode {
    /// All opcodes in wire order.
    pub const ALL: [Opcode; 13] = [
        Opcode::SetPins,
        Opcode::Init,
        Opcode::Clear,
        Opcode::SendCmd,
        Opcode::SendData,
        Opcode::Refresh,
        Opcode::Sleep,
        Opcode::SetTime,
        Opcode::WriteImg,
        Opcode::SetConfig,
        Opcode::SysReset,
        Opcode::SysSleep,
        Opcode::CfgErase,
    ];

    /// Wire byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::SetPins => "SET_PINS",
            Opcode::Init => "INIT",
            Opcode::Clear => "CLEAR",
            Opcode::SendCmd => "SEND_CMD",
            Opcode::SendData => "SEND_DATA",
            Opcode::Refresh => "REFRESH",
            Opcode::Sleep => "SLEEP",
            Opcode::SetTime => "SET_TIME",
            Opcode::WriteImg => "WRITE_IMG",
            Opcode::SetConfig => "SET_CONFIG",
            Opcode::SysReset => "SYS_RESET",
            Opcode::SysSleep => "SYS_SLEEP",
            Opcode::CfgErase => "CFG_ERASE",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = EpdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.as_u8() == value)
            .ok_or(EpdError::UnknownOpcode(value))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.as_u8())
    }
}

/// Image chunk tag byte: plane nibble in the low bits, continuation in the high bits.
pub mod tag {
    /// First chunk of a plane: start writing a new plane.
    pub const FIRST: u8 = 0x00;
    /// Any later chunk: append to the current plane.
    pub const CONTINUATION: u8 = 0xF0;
    /// Mask selecting the plane nibble.
    pub const PLANE_MASK: u8 = 0x0F;

    /// Black/white plane nibble.
    pub const PLANE_BW: u8 = 0x0F;
    /// Color (red, or the packed four-color stream) plane nibble.
    pub const PLANE_COLOR: u8 = 0x00;

    /// Build the tag byte for chunk `index` of a plane.
    #[inline]
    pub fn for_chunk(plane_nibble: u8, index: usize) -> u8 {
        let continuation = if index == 0 { FIRST } else { CONTINUATION };
        (plane_nibble & PLANE_MASK) | continuation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::SetPins.as_u8(), 0x00);
        assert_eq!(Opcode::Init.as_u8(), 0x01);
        assert_eq!(Opcode::Refresh.as_u8(), 0x05);
        assert_eq!(Opcode::SetTime.as_u8(), 0x20);
        assert_eq!(Opcode::WriteImg.as_u8(), 0x30);
        assert_eq!(Opcode::SetConfig.as_u8(), 0x90);
        assert_eq!(Opcode::CfgErase.as_u8(), 0x99);
    }

    #[test]
    fn test_try_from_every_known_opcode() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(op.as_u8()).unwrap(), op);
        }
    }

    #[test]
    fn test_try_from_unknown_rejected() {
        assert!(matches!(
            Opcode::try_from(0x07),
            Err(EpdError::UnknownOpcode(0x07))
        ));
        assert!(Opcode::try_from(0xff).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Opcode::WriteImg.to_string(), "WRITE_IMG(0x30)");
    }

    #[test]
    fn test_tag_first_and_continuation() {
        assert_eq!(tag::for_chunk(tag::PLANE_BW, 0), 0x0F);
        assert_eq!(tag::for_chunk(tag::PLANE_BW, 1), 0xFF);
        assert_eq!(tag::for_chunk(tag::PLANE_COLOR, 0), 0x00);
        assert_eq!(tag::for_chunk(tag::PLANE_COLOR, 7), 0xF0);
    }

    #[test]
    fn test_tag_masks_high_nibble_of_plane() {
        assert_eq!(tag::for_chunk(0xAF, 0), 0x0F);
    }
}
