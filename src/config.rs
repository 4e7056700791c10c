//! Link configuration.
//!
//! Defaults match the stock firmware. Any field may be overridden from a JSON
//! document; missing fields keep their defaults.
//!
//! ```
//! use epd_link::config::LinkConfig;
//!
//! let config = LinkConfig::from_json_str(r#"{ "mtu": 247, "interleave_budget": 10 }"#).unwrap();
//! assert_eq!(config.chunk_size(), 245);
//! assert_eq!(config.reconnect_delay_ms, 300);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EpdError, Result};
use crate::protocol::CHUNK_OVERHEAD;

/// Primary EPD service.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x62750001_d828_918d_fb46_b6c11c675aec);

/// Command/data characteristic (write + notify).
pub const DEFAULT_COMMAND_UUID: Uuid = Uuid::from_u128(0x62750002_d828_918d_fb46_b6c11c675aec);

/// Firmware version characteristic (read).
pub const DEFAULT_VERSION_UUID: Uuid = Uuid::from_u128(0x62750003_d828_918d_fb46_b6c11c675aec);

/// Default transport message size before the peripheral reports its own.
pub const DEFAULT_MTU: usize = 20;

/// Default number of unconfirmed chunk writes between confirmed ones.
pub const DEFAULT_INTERLEAVE_BUDGET: usize = 50;

/// Default delay between a forced disconnect and the reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 300;

/// Version assumed when the version characteristic cannot be read.
pub const DEFAULT_FALLBACK_FIRMWARE_VERSION: u8 = 0x15;

/// Oldest firmware that speaks the chunked image protocol.
pub const DEFAULT_MIN_FIRMWARE_VERSION: u8 = 0x16;

/// Default capacity of the client event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a device link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service advertised by the display.
    pub service_uuid: Uuid,
    /// Write + notify characteristic carrying command frames.
    pub command_uuid: Uuid,
    /// Optional read-only firmware version characteristic.
    pub version_uuid: Uuid,
    /// Transport message size ceiling (opcode and tag bytes included).
    pub mtu: usize,
    /// Unconfirmed writes allowed before a confirmed write is forced.
    pub interleave_budget: usize,
    /// Delay before reconnecting, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Version assumed when the version read fails.
    pub fallback_firmware_version: u8,
    /// Versions below this trigger a stale-firmware warning.
    pub min_firmware_version: u8,
    /// Capacity of the client event channel.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            command_uuid: DEFAULT_COMMAND_UUID,
            version_uuid: DEFAULT_VERSION_UUID,
            mtu: DEFAULT_MTU,
            interleave_budget: DEFAULT_INTERLEAVE_BUDGET,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            fallback_firmware_version: DEFAULT_FALLBACK_FIRMWARE_VERSION,
            min_firmware_version: DEFAULT_MIN_FIRMWARE_VERSION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl LinkConfig {
    /// Parse a JSON document, filling missing fields with defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that the values describe a usable link.
    pub fn validate(&self) -> Result<()> {
        if self.mtu <= CHUNK_OVERHEAD {
            return Err(EpdError::InvalidTransfer(format!(
                "mtu {} leaves no room for image data (overhead {})",
                self.mtu, CHUNK_OVERHEAD
            )));
        }
        if self.event_capacity == 0 {
            return Err(EpdError::InvalidState(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Image bytes per chunk at the configured MTU.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.mtu.saturating_sub(CHUNK_OVERHEAD)
    }

    /// Reconnect delay as a `Duration`.
    #[inline]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
