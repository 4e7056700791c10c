//! `SET_TIME` payload.
//!
//! ```text
//! ┌──────────────┬──────────┬──────┐
//! │ Unix seconds │ TZ hours │ Mode │
//! │ u32 BE       │ i8       │ u8   │
//! └──────────────┴──────────┴──────┘
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use super::frame::Command;
use super::opcode::Opcode;
use crate::error::{EpdError, Result};

/// Payload length in bytes.
pub const TIME_SYNC_LEN: usize = 6;

/// What the display shows after the time is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockMode {
    /// Only set the clock.
    Plain = 0,
    /// Calendar page.
    Calendar = 1,
    /// Clock face. Redrawn with full refreshes, so it must be confirmed.
    Clock = 2,
}

/// A time sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSync {
    timestamp: u32,
    tz_offset_hours: i8,
    mode: ClockMode,
    confirmed: bool,
}

impl TimeSync {
    /// Sync to an explicit timestamp.
    pub fn at(timestamp: u32, tz_offset_hours: i8, mode: ClockMode) -> Self {
        Self {
            timestamp,
            tz_offset_hours,
            mode,
            confirmed: false,
        }
    }

    /// Sync to the current system time.
    pub fn now(tz_offset_hours: i8, mode: ClockMode) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::at(wire_timestamp(secs), tz_offset_hours, mode)
    }

    /// Record the operator's consent to clock mode's full-refresh redraws.
    pub fn confirm_full_refresh(mut self) -> Self {
        self.confirmed = true;
        self
    }

    #[inline]
    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Encode the 6-byte payload.
    ///
    /// # Errors
    ///
    /// `ConfirmationRequired` for an unconfirmed [`ClockMode::Clock`] request.
    pub fn encode(&self) -> Result<[u8; TIME_SYNC_LEN]> {
        if self.mode == ClockMode::Clock && !self.confirmed {
            return Err(EpdError::ConfirmationRequired(
                "clock mode redraws with full refreshes".to_string(),
            ));
        }
        let mut buf = [0u8; TIME_SYNC_LEN];
        buf[0..4].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[4] = self.tz_offset_hours as u8;
        buf[5] = self.mode as u8;
        Ok(buf)
    }

    /// Build the `SET_TIME` command.
    pub fn to_command(&self) -> Result<Command> {
        Ok(Command::new(Opcode::SetTime, self.encode()?.to_vec()))
    }
}

/// Unix seconds as the 32-bit wire field, saturating past 2106.
fn wire_timestamp(secs: u64) -> u32 {
    u32::try_from(secs).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_big_endian() {
        let sync = TimeSync::at(0x0102_0304, 8, ClockMode::Calendar);
        assert_eq!(sync.encode().unwrap(), [0x01, 0x02, 0x03, 0x04, 0x08, 0x01]);
    }

    #[test]
    fn test_wire_timestamp_saturates() {
        assert_eq!(wire_timestamp(1_700_000_000), 1_700_000_000);
        assert_eq!(wire_timestamp(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(wire_timestamp(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(wire_timestamp(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_negative_offset_is_twos_complement() {
        let sync = TimeSync::at(0, -5, ClockMode::Plain);
        assert_eq!(sync.encode().unwrap()[4], 0xFB);
    }

    #[test]
    fn test_clock_mode_requires_confirmation() {
        let sync = TimeSync::at(1, 0, ClockMode::Clock);
        assert!(matches!(
            sync.encode(),
            Err(EpdError::ConfirmationRequired(_))
        ));

        let confirmed = sync.confirm_full_refresh();
        assert_eq!(confirmed.encode().unwrap()[5], 2);
    }

    #[test]
    fn test_to_command() {
        let cmd = TimeSync::at(10, 1, ClockMode::Plain).to_command().unwrap();
        assert_eq!(cmd.opcode(), Opcode::SetTime);
        assert_eq!(cmd.payload().len(), TIME_SYNC_LEN);
    }

    #[test]
    fn test_now_is_recent() {
        let sync = TimeSync::now(0, ClockMode::Plain);
        // 2023-11-14 or later
        assert!(sync.timestamp() > 1_700_000_000);
    }
}
