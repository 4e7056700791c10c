//! In-process peripheral.
//!
//! [`MemoryTransport`] behaves like a display running the stock firmware:
//! it records every write, pushes its config snapshot as the first
//! notification after subscribe, and can be scripted to fail any lifecycle
//! step or drop the link mid-transfer.
//!
//! # Example
//!
//! ```
//! use epd_link::transport::{MemoryTransport, PeripheralScript};
//!
//! let transport = MemoryTransport::with_script(PeripheralScript {
//!     firmware_version: Some(0x17),
//!     ..PeripheralScript::default()
//! });
//! assert!(!transport.is_connected());
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    CharacteristicHandle, DeviceHandle, DisconnectReason, DisconnectSignal, NotificationStream,
    ServiceHandle, Transport,
};
use crate::config::{DEFAULT_COMMAND_UUID, DEFAULT_SERVICE_UUID, DEFAULT_VERSION_UUID};
use crate::error::{EpdError, Result};
use crate::interleave::WriteMode;
use crate::protocol::Opcode;

/// What happens when the client asks for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// A device is picked.
    Device(DeviceHandle),
    /// The picker is dismissed.
    Cancelled,
    /// The radio is off.
    RadioOff,
}

/// A step of connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStep {
    Connect,
    ServiceDiscovery,
    CharacteristicDiscovery,
}

/// Behaviour of the simulated peripheral.
#[derive(Debug, Clone)]
pub struct PeripheralScript {
    pub selection: SelectionOutcome,
    pub service_uuid: Uuid,
    pub command_uuid: Uuid,
    pub version_uuid: Uuid,
    /// Refuse the connection.
    pub fail_connect: bool,
    /// Hide the command characteristic.
    pub missing_command_characteristic: bool,
    /// Version byte, or `None` to make the version read fail.
    pub firmware_version: Option<u8>,
    /// Refuse to enable notifications.
    pub fail_subscribe: bool,
    /// First notification after subscribe.
    pub config_snapshot: Option<Vec<u8>>,
    /// Fail the image chunk with this zero-based index (once).
    pub fail_image_chunk: Option<usize>,
    /// Drop the link after this many image chunks were accepted (once).
    pub drop_after_image_chunks: Option<usize>,
    /// Drop the link while this setup step runs (once).
    pub drop_during: Option<LifecycleStep>,
}

impl Default for PeripheralScript {
    fn default() -> Self {
        Self {
            selection: SelectionOutcome::Device(DeviceHandle {
                id: "00:11:22:33:44:55".to_string(),
                name: Some("NRF_EPD_4455".to_string()),
            }),
            service_uuid: DEFAULT_SERVICE_UUID,
            command_uuid: DEFAULT_COMMAND_UUID,
            version_uuid: DEFAULT_VERSION_UUID,
            fail_connect: false,
            missing_command_characteristic: false,
            firmware_version: Some(0x16),
            fail_subscribe: false,
            config_snapshot: Some(vec![0u8; 8]),
            fail_image_chunk: None,
            drop_after_image_chunks: None,
            drop_during: None,
        }
    }
}

/// A write the peripheral accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub mode: WriteMode,
    pub data: Bytes,
}

impl RecordedWrite {
    /// Opcode byte of the frame.
    pub fn opcode(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Whether this is a `WRITE_IMG` frame.
    pub fn is_image_chunk(&self) -> bool {
        self.opcode() == Some(Opcode::WriteImg.as_u8())
    }
}

#[derive(Default)]
struct PeripheralState {
    connected: bool,
    writes: Vec<RecordedWrite>,
    image_chunk_attempts: usize,
    image_chunks_accepted: usize,
    notify_tx: Option<mpsc::UnboundedSender<Bytes>>,
    disconnect_txs: Vec<mpsc::UnboundedSender<DisconnectReason>>,
    select_count: usize,
    connect_count: usize,
}

struct Inner {
    script: Mutex<PeripheralScript>,
    state: Mutex<PeripheralState>,
}

/// Scriptable in-memory peripheral. Clones share the same device.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    /// Peripheral with the default script.
    pub fn new() -> Self {
        Self::with_script(PeripheralScript::default())
    }

    /// Peripheral with a custom script.
    pub fn with_script(script: PeripheralScript) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script),
                state: Mutex::new(PeripheralState::default()),
            }),
        }
    }

    /// Change the script in place (takes effect on the next operation).
    pub fn update_script(&self, f: impl FnOnce(&mut PeripheralScript)) {
        f(&mut lock(&self.inner.script));
    }

    /// All accepted writes since creation.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.inner.state).writes.clone()
    }

    /// Accepted `WRITE_IMG` frames.
    pub fn image_chunks(&self) -> Vec<RecordedWrite> {
        self.writes()
            .into_iter()
            .filter(RecordedWrite::is_image_chunk)
            .collect()
    }

    /// Forget recorded writes and chunk counters.
    pub fn clear_writes(&self) {
        let mut state = lock(&self.inner.state);
        state.writes.clear();
        state.image_chunk_attempts = 0;
        state.image_chunks_accepted = 0;
    }

    /// Push a notification to the subscribed client. Returns `false` if no
    /// one is subscribed.
    pub fn notify(&self, payload: impl Into<Bytes>) -> bool {
        let state = lock(&self.inner.state);
        match &state.notify_tx {
            Some(tx) => tx.send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// Simulate an unsolicited link loss.
    pub fn drop_link(&self) {
        let mut state = lock(&self.inner.state);
        Self::close_link(&mut state, DisconnectReason::LinkLost);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).connected
    }

    /// Number of device selections performed.
    pub fn select_count(&self) -> usize {
        lock(&self.inner.state).select_count
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        lock(&self.inner.state).connect_count
    }

    fn close_link(state: &mut PeripheralState, reason: DisconnectReason) {
        state.connected = false;
        state.notify_tx = None;
        for tx in state.disconnect_txs.drain(..) {
            let _ = tx.send(reason);
        }
    }

    /// Close the link if the script drops it during `step`.
    fn drop_during(&self, step: LifecycleStep) {
        {
            let mut script = lock(&self.inner.script);
            if script.drop_during != Some(step) {
                return;
            }
            script.drop_during = None;
        }
        let mut state = lock(&self.inner.state);
        Self::close_link(&mut state, DisconnectReason::LinkLost);
    }

    fn script(&self) -> PeripheralScript {
        lock(&self.inner.script).clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if lock(&self.inner.state).connected {
            Ok(())
        } else {
            Err(EpdError::WriteFailed("link is down".to_string()))
        }
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        // Let the radio "transmit": other tasks (disconnect watcher,
        // notification demux) run between writes as they would on hardware.
        tokio::task::yield_now().await;

        let script = self.script();
        if characteristic.uuid != script.command_uuid {
            return Err(EpdError::WriteFailed(format!(
                "characteristic {} is not writable",
                characteristic.uuid
            )));
        }

        let mut state = lock(&self.inner.state);
        if !state.connected {
            return Err(EpdError::WriteFailed("link is down".to_string()));
        }

        let is_chunk = data.first() == Some(&Opcode::WriteImg.as_u8());
        if is_chunk {
            let attempt = state.image_chunk_attempts;
            state.image_chunk_attempts += 1;
            if script.fail_image_chunk == Some(attempt) {
                drop(state);
                self.update_script(|s| s.fail_image_chunk = None);
                return Err(EpdError::WriteFailed(format!(
                    "GATT error on image chunk {}",
                    attempt
                )));
            }
        }

        state.writes.push(RecordedWrite {
            mode,
            data: Bytes::copy_from_slice(data),
        });

        if is_chunk {
            state.image_chunks_accepted += 1;
            if script.drop_after_image_chunks == Some(state.image_chunks_accepted) {
                Self::close_link(&mut state, DisconnectReason::LinkLost);
                drop(state);
                self.update_script(|s| s.drop_after_image_chunks = None);
            }
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request_device(&self, service: Uuid) -> Result<DeviceHandle> {
        let script = self.script();
        lock(&self.inner.state).select_count += 1;
        match script.selection {
            SelectionOutcome::Device(device) if service == script.service_uuid => Ok(device),
            SelectionOutcome::Device(_) => Err(EpdError::NoDeviceSelected),
            SelectionOutcome::Cancelled => Err(EpdError::NoDeviceSelected),
            SelectionOutcome::RadioOff => Err(EpdError::TransportUnavailable(
                "Bluetooth adapter is powered off".to_string(),
            )),
        }
    }

    fn disconnect_signal(&self, _device: &DeviceHandle) -> DisconnectSignal {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.state).disconnect_txs.push(tx);
        rx
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<()> {
        tokio::task::yield_now().await;
        if self.script().fail_connect {
            return Err(EpdError::ConnectFailed(format!("{} did not respond", device)));
        }
        {
            let mut state = lock(&self.inner.state);
            state.connected = true;
            state.connect_count += 1;
        }
        self.drop_during(LifecycleStep::Connect);
        Ok(())
    }

    async fn discover_service(&self, uuid: Uuid) -> Result<ServiceHandle> {
        tokio::task::yield_now().await;
        self.drop_during(LifecycleStep::ServiceDiscovery);
        self.ensure_connected()
            .map_err(|e| EpdError::DiscoveryFailed(e.to_string()))?;
        if uuid == self.script().service_uuid {
            Ok(ServiceHandle { uuid })
        } else {
            Err(EpdError::DiscoveryFailed(format!("service {} not found", uuid)))
        }
    }

    async fn discover_characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<CharacteristicHandle> {
        tokio::task::yield_now().await;
        self.drop_during(LifecycleStep::CharacteristicDiscovery);
        self.ensure_connected()
            .map_err(|e| EpdError::DiscoveryFailed(e.to_string()))?;
        let script = self.script();
        let present = (uuid == script.command_uuid && !script.missing_command_characteristic)
            || (uuid == script.version_uuid && script.firmware_version.is_some());
        if present && service.uuid == script.service_uuid {
            Ok(CharacteristicHandle {
                service: service.uuid,
                uuid,
            })
        } else {
            Err(EpdError::DiscoveryFailed(format!(
                "characteristic {} not found",
                uuid
            )))
        }
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        let script = self.script();
        match script.firmware_version {
            Some(version) if characteristic.uuid == script.version_uuid => Ok(vec![version]),
            _ => Err(EpdError::VersionReadFailed(format!(
                "characteristic {} is not readable",
                characteristic.uuid
            ))),
        }
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<NotificationStream> {
        let script = self.script();
        if script.fail_subscribe || characteristic.uuid != script.command_uuid {
            return Err(EpdError::SubscribeFailed(
                "notifications not supported".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(snapshot) = script.config_snapshot {
            let _ = tx.send(Bytes::from(snapshot));
        }
        lock(&self.inner.state).notify_tx = Some(tx);
        Ok(rx)
    }

    async fn write_with_response(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()> {
        self.write(characteristic, data, WriteMode::Confirmed).await
    }

    async fn write_without_response(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()> {
        self.write(characteristic, data, WriteMode::Unconfirmed).await
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        Self::close_link(&mut state, DisconnectReason::Requested);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_handle() -> CharacteristicHandle {
        CharacteristicHandle {
            service: DEFAULT_SERVICE_UUID,
            uuid: DEFAULT_COMMAND_UUID,
        }
    }

    #[tokio::test]
    async fn test_selection_outcomes() {
        let transport = MemoryTransport::new();
        assert!(transport.request_device(DEFAULT_SERVICE_UUID).await.is_ok());

        transport.update_script(|s| s.selection = SelectionOutcome::Cancelled);
        assert!(matches!(
            transport.request_device(DEFAULT_SERVICE_UUID).await,
            Err(EpdError::NoDeviceSelected)
        ));

        transport.update_script(|s| s.selection = SelectionOutcome::RadioOff);
        assert!(matches!(
            transport.request_device(DEFAULT_SERVICE_UUID).await,
            Err(EpdError::TransportUnavailable(_))
        ));
        assert_eq!(transport.select_count(), 3);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let transport = MemoryTransport::new();
        let result = transport.write_with_response(&command_handle(), &[0x01]).await;
        assert!(matches!(result, Err(EpdError::WriteFailed(_))));
    }

    #[tokio::test]
    async fn test_writes_recorded_with_mode() {
        let transport = MemoryTransport::new();
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        transport.connect(&device).await.unwrap();

        let ch = command_handle();
        transport.write_with_response(&ch, &[0x01]).await.unwrap();
        transport.write_without_response(&ch, &[0x30, 0x0F, 1]).await.unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].mode, WriteMode::Confirmed);
        assert_eq!(writes[1].mode, WriteMode::Unconfirmed);
        assert!(writes[1].is_image_chunk());
        assert_eq!(transport.image_chunks().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_first_notification() {
        let transport = MemoryTransport::with_script(PeripheralScript {
            config_snapshot: Some(vec![1, 2, 3]),
            ..PeripheralScript::default()
        });
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        transport.connect(&device).await.unwrap();

        let mut rx = transport.subscribe(&command_handle()).await.unwrap();
        assert!(transport.notify(Bytes::from_static(b"mtu=64")));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"mtu=64"));
    }

    #[tokio::test]
    async fn test_drop_link_fires_signal() {
        let transport = MemoryTransport::new();
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        let mut signal = transport.disconnect_signal(&device);
        transport.connect(&device).await.unwrap();

        transport.drop_link();
        assert_eq!(signal.recv().await, Some(DisconnectReason::LinkLost));
        assert!(!transport.is_connected());
        assert!(!transport.notify(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_drop_during_connect_fires_signal_once() {
        let transport = MemoryTransport::with_script(PeripheralScript {
            drop_during: Some(LifecycleStep::Connect),
            ..PeripheralScript::default()
        });
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        let mut signal = transport.disconnect_signal(&device);

        assert!(transport.connect(&device).await.is_ok());
        assert_eq!(signal.recv().await, Some(DisconnectReason::LinkLost));
        assert!(!transport.is_connected());

        transport.connect(&device).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_during_discovery_fails_lookup() {
        let transport = MemoryTransport::with_script(PeripheralScript {
            drop_during: Some(LifecycleStep::CharacteristicDiscovery),
            ..PeripheralScript::default()
        });
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        let mut signal = transport.disconnect_signal(&device);
        transport.connect(&device).await.unwrap();

        let service = transport.discover_service(DEFAULT_SERVICE_UUID).await.unwrap();
        assert!(matches!(
            transport
                .discover_characteristic(&service, DEFAULT_COMMAND_UUID)
                .await,
            Err(EpdError::DiscoveryFailed(_))
        ));
        assert_eq!(signal.recv().await, Some(DisconnectReason::LinkLost));
    }

    #[tokio::test]
    async fn test_fail_image_chunk_is_one_shot() {
        let transport = MemoryTransport::with_script(PeripheralScript {
            fail_image_chunk: Some(1),
            ..PeripheralScript::default()
        });
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        transport.connect(&device).await.unwrap();
        let ch = command_handle();

        assert!(transport.write_without_response(&ch, &[0x30, 0x0F]).await.is_ok());
        assert!(transport.write_without_response(&ch, &[0x30, 0xFF]).await.is_err());
        assert!(transport.write_without_response(&ch, &[0x30, 0xFF]).await.is_ok());
        assert_eq!(transport.image_chunks().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_version_characteristic() {
        let transport = MemoryTransport::with_script(PeripheralScript {
            firmware_version: None,
            ..PeripheralScript::default()
        });
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        transport.connect(&device).await.unwrap();
        let service = transport.discover_service(DEFAULT_SERVICE_UUID).await.unwrap();
        assert!(matches!(
            transport
                .discover_characteristic(&service, DEFAULT_VERSION_UUID)
                .await,
            Err(EpdError::DiscoveryFailed(_))
        ));
    }
}
