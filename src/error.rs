//! Error types for epd-link.

use thiserror::Error;

/// Main error type for all device link operations.
#[derive(Debug, Error)]
pub enum EpdError {
    /// The radio is disabled or the platform has no usable transport.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The user or system aborted device selection.
    #[error("No device selected")]
    NoDeviceSelected,

    /// The peripheral refused or dropped the connection attempt.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Service or characteristic discovery failed.
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A single command or chunk write failed.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Enabling notifications failed (non-fatal to the connection).
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Reading the firmware version characteristic failed (non-fatal).
    #[error("Version read failed: {0}")]
    VersionReadFailed(String),

    /// No connection is active.
    #[error("Not connected")]
    NotConnected,

    /// The link dropped while an operation was in progress.
    #[error("Disconnected")]
    Disconnected,

    /// Command payload could not be encoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Byte is not part of the command opcode set.
    #[error("Unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Transfer parameters are out of range.
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// The requested operation is not legal in the current link state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation needs explicit operator confirmation.
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EpdError {
    /// Whether this error is the silent "user cancelled the picker" case.
    pub fn is_user_abort(&self) -> bool {
        matches!(self, EpdError::NoDeviceSelected)
    }

    /// Whether the connection survives this error.
    pub fn is_degraded_only(&self) -> bool {
        matches!(
            self,
            EpdError::SubscribeFailed(_) | EpdError::VersionReadFailed(_)
        )
    }
}

/// Result type alias using EpdError.
pub type Result<T> = std::result::Result<T, EpdError>;
