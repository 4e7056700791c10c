//! Events published by the client for the UI/editor side.

use crate::notify::ConfigSnapshot;
use crate::transfer::TransferProgress;
use crate::transport::DeviceHandle;

/// Something the operator-facing side may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The link reached `Ready`.
    Connected {
        device: DeviceHandle,
        firmware_version: u8,
    },
    /// The link went back to `Idle`.
    Disconnected,
    /// Firmware older than the configured minimum.
    StaleFirmware { version: u8, minimum: u8 },
    /// First notification after (re)connect.
    ConfigSnapshot(ConfigSnapshot),
    /// A status line from the peripheral, verbatim.
    Status(String),
    /// The peripheral reported a new MTU.
    MtuUpdated(usize),
    /// The peripheral's clock, in seconds.
    RemoteTime(i64),
    /// One chunk of an image plane was written.
    Progress(TransferProgress),
}
