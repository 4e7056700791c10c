//! Transport module - the capability boundary to the wireless stack.
//!
//! The core never talks to a radio directly. A [`Transport`] provides device
//! selection, connection, GATT discovery, reads, notifications and the two
//! write flavours:
//!
//! - [`Transport::write_with_response`] returns once the peripheral acknowledged
//! - [`Transport::write_without_response`] returns once the write is queued
//!
//! Notifications and disconnects are delivered over channels so the client can
//! consume them from dedicated tasks in arrival order.
//!
//! [`MemoryTransport`] is an in-process peripheral for tests and demos.

mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

pub use memory::{
    LifecycleStep, MemoryTransport, PeripheralScript, RecordedWrite, SelectionOutcome,
};

/// Ordered stream of notification payloads from one characteristic.
pub type NotificationStream = mpsc::UnboundedReceiver<Bytes>;

/// Fires once when the link drops. The sender must stay alive for as long
/// as the link does.
pub type DisconnectSignal = mpsc::UnboundedReceiver<DisconnectReason>;

/// Why a link went down. The client reacts to every reason the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The host asked for the disconnect.
    Requested,
    /// Supervision timeout, out of range, peripheral reset, ...
    LinkLost,
}

/// A selected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    /// Stack-specific identifier (address or platform id).
    pub id: String,
    /// Advertised name, if any.
    pub name: Option<String>,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub uuid: Uuid,
}

/// A discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Capabilities required from the underlying wireless stack.
///
/// Implementations hold at most one link at a time; the client never calls
/// `connect` twice without a `disconnect` in between.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Let the user or system pick a peripheral exposing `service`.
    ///
    /// Fails with `NoDeviceSelected` on abort and `TransportUnavailable` when
    /// the radio is off or unsupported.
    async fn request_device(&self, service: Uuid) -> Result<DeviceHandle>;

    /// Register for the link-down signal of `device`. Called before `connect`
    /// so a drop during the attempt is observed.
    fn disconnect_signal(&self, device: &DeviceHandle) -> DisconnectSignal;

    /// Open the link. Fails with `ConnectFailed`.
    async fn connect(&self, device: &DeviceHandle) -> Result<()>;

    /// Find a primary service. Fails with `DiscoveryFailed`.
    async fn discover_service(&self, uuid: Uuid) -> Result<ServiceHandle>;

    /// Find a characteristic of `service`. Fails with `DiscoveryFailed`.
    async fn discover_characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<CharacteristicHandle>;

    /// Read a characteristic value. Fails with `VersionReadFailed` for the
    /// version characteristic.
    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>>;

    /// Enable notifications. Fails with `SubscribeFailed`.
    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<NotificationStream>;

    /// Write and wait for the peripheral's acknowledgement.
    async fn write_with_response(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()>;

    /// Queue a write with no delivery guarantee.
    async fn write_without_response(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()>;

    /// Close the link. Raises the disconnect signal.
    async fn disconnect(&self) -> Result<()>;
}
