//! Client builder and connection lifecycle.
//!
//! The [`EpdClientBuilder`] provides a fluent API for configuring the link.
//! The [`EpdClient`] drives the lifecycle:
//! 1. Select a device (skipped on reconnect)
//! 2. Register for disconnects, then connect
//! 3. Discover the service and command characteristic
//! 4. Read the firmware version (falls back on failure)
//! 5. Subscribe to notifications (non-fatal on failure)
//! 6. Send `INIT`
//!
//! A disconnect in any state tears the connection down and returns to
//! `Idle`. Transfers in flight stop before their next chunk.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use epd_link::{ColorMode, EpdClient, MemoryTransport};
//!
//! # tokio_test_block_on(async {
//! let transport = MemoryTransport::new();
//! let client = EpdClient::builder(Arc::new(transport.clone()))
//!     .interleave_budget(3)
//!     .build()
//!     .unwrap();
//!
//! client.connect().await.unwrap();
//! let report = client
//!     .send_image(ColorMode::BlackWhite, Bytes::from(vec![0xFF; 1000]))
//!     .await
//!     .unwrap();
//! assert_eq!(report.planes[0].chunks, 56);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::connection::{CommandChannel, Connection};
use crate::error::{EpdError, Result};
use crate::event::ClientEvent;
use crate::notify::{ConfigSnapshot, DeviceStatus, NotificationDemux};
use crate::protocol::{ColorMode, Command, DriverModel, FramePayload, Opcode, TimeSync};
use crate::state::{LinkEvent, LinkState};
use crate::transfer::{self, ImagePlanes, ImageReport, Plane, TransferJob, TransferReport};
use crate::transport::{
    CharacteristicHandle, DeviceHandle, DisconnectReason, DisconnectSignal, ServiceHandle,
    Transport,
};

/// Builder for configuring and creating an [`EpdClient`].
pub struct EpdClientBuilder {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
}

impl EpdClientBuilder {
    /// Create a builder with default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: LinkConfig::default(),
        }
    }

    /// Replace the whole configuration, e.g. one loaded from JSON.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the initial transport message size ceiling.
    ///
    /// Default: 20
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set how many unconfirmed chunk writes may precede a confirmed one.
    ///
    /// Default: 50
    pub fn interleave_budget(mut self, budget: usize) -> Self {
        self.config.interleave_budget = budget;
        self
    }

    /// Set the pause between teardown and reconnect.
    ///
    /// Default: 300 ms
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        self.config.service_uuid = uuid;
        self
    }

    pub fn command_uuid(mut self, uuid: Uuid) -> Self {
        self.config.command_uuid = uuid;
        self
    }

    pub fn version_uuid(mut self, uuid: Uuid) -> Self {
        self.config.version_uuid = uuid;
        self
    }

    /// Version assumed when the version characteristic cannot be read.
    ///
    /// Default: 0x15
    pub fn fallback_firmware_version(mut self, version: u8) -> Self {
        self.config.fallback_firmware_version = version;
        self
    }

    /// Oldest firmware that does not trigger a stale-firmware warning.
    ///
    /// Default: 0x16
    pub fn min_firmware_version(mut self, version: u8) -> Self {
        self.config.min_firmware_version = version;
        self
    }

    /// Set the event channel capacity. Slow subscribers lose the oldest
    /// events.
    ///
    /// Default: 256
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Validate the configuration and build the client. No connection is
    /// made until [`EpdClient::connect`].
    pub fn build(self) -> Result<EpdClient> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(self.config.event_capacity);
        Ok(EpdClient {
            transport: self.transport,
            config: self.config,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                events,
            }),
        })
    }
}

/// How well an image color mode suits the peripheral's configured driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFit {
    /// The driver expects this color mode.
    Matches(&'static DriverModel),
    /// The driver expects a different color mode.
    Mismatch {
        driver: &'static DriverModel,
        expected: ColorMode,
    },
    /// No snapshot yet, or the driver id is not in the catalogue.
    UnknownDriver,
}

/// Read-only view of the live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub device: DeviceHandle,
    pub service: ServiceHandle,
    pub command: CharacteristicHandle,
    pub version: Option<CharacteristicHandle>,
    pub firmware_version: u8,
    pub mtu: usize,
    pub snapshot: Option<ConfigSnapshot>,
}

#[derive(Default)]
struct Slot {
    state: LinkState,
    /// Bumped on every connect attempt.
    epoch: u64,
    connection: Option<Connection>,
    /// Last selected device, reused by reconnect.
    device: Option<DeviceHandle>,
}

/// State shared with the per-connection tasks.
struct Shared {
    slot: Mutex<Slot>,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Apply `event` to the attempt identified by `epoch`.
    fn advance(&self, epoch: u64, event: LinkEvent) -> Result<LinkState> {
        let mut slot = self.lock();
        if slot.epoch != epoch || slot.state == LinkState::Idle {
            return Err(EpdError::Disconnected);
        }
        let next = slot.state.on(event).ok_or_else(|| {
            EpdError::InvalidState(format!("{:?} while {}", event, slot.state))
        })?;
        tracing::debug!("Link {} -> {}", slot.state, next);
        slot.state = next;
        Ok(next)
    }

    /// Return to `Idle` if `epoch` is still the current attempt. Returns
    /// whether anything was torn down.
    ///
    /// `Disconnected` is published only if a link was attempted; leaving
    /// `Requesting` is silent.
    fn teardown(&self, epoch: u64) -> bool {
        let (connection, was_requesting) = {
            let mut slot = self.lock();
            if slot.epoch != epoch || slot.state == LinkState::Idle {
                return false;
            }
            tracing::debug!("Link {} -> {}", slot.state, LinkState::Idle);
            let was_requesting = slot.state == LinkState::Requesting;
            slot.state = LinkState::Idle;
            (slot.connection.take(), was_requesting)
        };
        // Marks the channel dead and stops the connection's tasks.
        drop(connection);
        if !was_requesting {
            self.emit(ClientEvent::Disconnected);
        }
        true
    }

    fn finish_transfer(&self, epoch: u64) {
        let mut slot = self.lock();
        if slot.epoch == epoch && slot.state == LinkState::Streaming {
            slot.state = LinkState::Ready;
        }
    }
}

/// Aborts the wrapped tasks unless handed over to a [`Connection`].
struct TaskGuard(Vec<JoinHandle<()>>);

impl TaskGuard {
    fn into_inner(mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

async fn watch_disconnect(shared: Arc<Shared>, epoch: u64, mut signal: DisconnectSignal) {
    let reason = signal.recv().await.unwrap_or(DisconnectReason::LinkLost);
    if shared.teardown(epoch) {
        tracing::info!("Disconnected ({:?})", reason);
    }
}

/// Host-side driver for one e-paper display.
///
/// Operations are meant to be called from one sequential flow: the
/// client does not serialize concurrent transfers on the same link.
/// Events are observed through [`EpdClient::subscribe`].
pub struct EpdClient {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    shared: Arc<Shared>,
}

impl EpdClient {
    /// Create a new client builder.
    pub fn builder(transport: Arc<dyn Transport>) -> EpdClientBuilder {
        EpdClientBuilder::new(transport)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().state
    }

    /// Whether commands can be sent.
    pub fn is_connected(&self) -> bool {
        let slot = self.shared.lock();
        slot.state.is_ready() && slot.connection.as_ref().is_some_and(|c| c.is_alive())
    }

    /// Last selected device.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.shared.lock().device.clone()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        let slot = self.shared.lock();
        slot.connection.as_ref().map(|c| ConnectionInfo {
            device: c.device.clone(),
            service: c.service,
            command: *c.channel.characteristic(),
            version: c.version_characteristic,
            firmware_version: c.firmware_version,
            mtu: c.status.mtu(),
            snapshot: c.status.snapshot(),
        })
    }

    /// Select a device and connect to it.
    ///
    /// A live connection is closed first. Fails with `InvalidState` while
    /// another connect is in progress. Cancelling the picker returns
    /// `NoDeviceSelected` and leaves the client `Idle`.
    pub async fn connect(&self) -> Result<()> {
        self.close_existing().await?;
        let epoch = self.begin_attempt()?;
        let device = self.select_device(epoch).await?;
        self.establish(epoch, device).await
    }

    /// Reconnect to the last selected device.
    ///
    /// Forces a disconnect, waits the configured delay, then connects.
    /// Without a known device this behaves like [`EpdClient::connect`].
    pub async fn reconnect(&self) -> Result<()> {
        let known = {
            let slot = self.shared.lock();
            if slot.state.is_connecting() {
                return Err(EpdError::InvalidState(
                    "connect already in progress".to_string(),
                ));
            }
            slot.device.clone()
        };

        match &known {
            Some(device) => tracing::info!("Reconnecting to {}", device),
            None => tracing::info!("Reconnecting without a known device"),
        }
        self.disconnect().await?;
        tokio::time::sleep(self.config.reconnect_delay()).await;

        let epoch = self.begin_attempt()?;
        let device = match known {
            Some(device) => device,
            None => self.select_device(epoch).await?,
        };
        self.establish(epoch, device).await
    }

    /// Close the link. A no-op when already `Idle`.
    pub async fn disconnect(&self) -> Result<()> {
        let epoch = self.shared.lock().epoch;
        if self.shared.teardown(epoch) {
            tracing::info!("Disconnecting");
            self.transport.disconnect().await?;
        }
        Ok(())
    }

    async fn close_existing(&self) -> Result<()> {
        let state = self.state();
        if state.is_connecting() {
            return Err(EpdError::InvalidState(
                "connect already in progress".to_string(),
            ));
        }
        if state != LinkState::Idle {
            self.disconnect().await?;
        }
        Ok(())
    }

    fn begin_attempt(&self) -> Result<u64> {
        let mut slot = self.shared.lock();
        let next = slot.state.on(LinkEvent::Request).ok_or_else(|| {
            EpdError::InvalidState(format!("cannot connect while {}", slot.state))
        })?;
        slot.epoch += 1;
        slot.state = next;
        Ok(slot.epoch)
    }

    async fn select_device(&self, epoch: u64) -> Result<DeviceHandle> {
        tracing::info!("Requesting device with service {}", self.config.service_uuid);
        match self.transport.request_device(self.config.service_uuid).await {
            Ok(device) => {
                self.shared.lock().device = Some(device.clone());
                Ok(device)
            }
            Err(e) => {
                self.shared.teardown(epoch);
                if e.is_user_abort() {
                    tracing::info!("Device selection cancelled");
                } else {
                    tracing::error!("Device request failed: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, epoch: u64, device: DeviceHandle) -> Result<()> {
        match self.open(epoch, &device).await {
            Ok(channel) => {
                // The link is usable even if INIT is lost; report it anyway.
                channel.send(&Command::empty(Opcode::Init)).await
            }
            Err(e) => {
                tracing::error!("Connection to {} failed: {}", device, e);
                if self.shared.teardown(epoch) {
                    let _ = self.transport.disconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn open(&self, epoch: u64, device: &DeviceHandle) -> Result<CommandChannel> {
        self.shared.advance(epoch, LinkEvent::DeviceSelected)?;

        let signal = self.transport.disconnect_signal(device);
        let mut tasks = TaskGuard(vec![tokio::spawn(watch_disconnect(
            self.shared.clone(),
            epoch,
            signal,
        ))]);

        tracing::info!("Connecting to {}", device);
        self.transport.connect(device).await?;
        self.shared.advance(epoch, LinkEvent::Connected)?;

        let service = self.transport.discover_service(self.config.service_uuid).await?;
        tracing::debug!("Found service {}", service.uuid);
        let command = self
            .transport
            .discover_characteristic(&service, self.config.command_uuid)
            .await?;
        tracing::debug!("Found command characteristic {}", command.uuid);
        self.shared.advance(epoch, LinkEvent::ServicesDiscovered)?;

        let (version_characteristic, firmware_version) = self.read_firmware_version(&service).await;
        if firmware_version < self.config.min_firmware_version {
            tracing::warn!(
                "Firmware 0x{:02x} is older than 0x{:02x}; some commands may not work",
                firmware_version,
                self.config.min_firmware_version
            );
            self.shared.emit(ClientEvent::StaleFirmware {
                version: firmware_version,
                minimum: self.config.min_firmware_version,
            });
        }

        let channel = CommandChannel::new(
            self.transport.clone(),
            command,
            Arc::new(AtomicBool::new(true)),
        );
        let status = Arc::new(DeviceStatus::new(self.config.mtu));

        match self.transport.subscribe(&command).await {
            Ok(stream) => {
                let demux = NotificationDemux::new(status.clone());
                tasks
                    .0
                    .push(tokio::spawn(demux.run(stream, self.shared.events.clone())));
            }
            Err(e) => tracing::warn!("Notifications unavailable: {}", e),
        }

        {
            let mut slot = self.shared.lock();
            if slot.epoch != epoch || slot.state == LinkState::Idle {
                return Err(EpdError::Disconnected);
            }
            let next = slot.state.on(LinkEvent::Subscribed).ok_or_else(|| {
                EpdError::InvalidState(format!("Subscribed while {}", slot.state))
            })?;
            slot.state = next;
            slot.connection = Some(Connection::new(
                device.clone(),
                service,
                channel.clone(),
                version_characteristic,
                firmware_version,
                status,
                tasks.into_inner(),
            ));
        }

        tracing::info!(
            "Connected to {} (firmware 0x{:02x})",
            device,
            firmware_version
        );
        self.shared.emit(ClientEvent::Connected {
            device: device.clone(),
            firmware_version,
        });
        Ok(channel)
    }

    async fn read_firmware_version(
        &self,
        service: &ServiceHandle,
    ) -> (Option<CharacteristicHandle>, u8) {
        let fallback = self.config.fallback_firmware_version;
        let characteristic = match self
            .transport
            .discover_characteristic(service, self.config.version_uuid)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("No version characteristic ({}), assuming 0x{:02x}", e, fallback);
                return (None, fallback);
            }
        };

        match self.transport.read(&characteristic).await {
            Ok(value) => match value.first() {
                Some(&version) => {
                    tracing::info!("Firmware version 0x{:02x}", version);
                    (Some(characteristic), version)
                }
                None => {
                    tracing::warn!("Empty version value, assuming 0x{:02x}", fallback);
                    (Some(characteristic), fallback)
                }
            },
            Err(e) => {
                tracing::warn!("{}, assuming 0x{:02x}", e, fallback);
                (Some(characteristic), fallback)
            }
        }
    }

    fn channel(&self) -> Result<CommandChannel> {
        let slot = self.shared.lock();
        match &slot.connection {
            Some(c) if slot.state.is_ready() && c.is_alive() => Ok(c.channel.clone()),
            _ => Err(EpdError::NotConnected),
        }
    }

    /// Send one command as a confirmed write.
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        self.channel()?.send(command).await
    }

    /// Load a pin map and select a driver: `SET_PINS` then `INIT`.
    pub async fn set_driver(&self, pins_hex: &str, driver_hex: &str) -> Result<()> {
        let pins = Command::with_payload(Opcode::SetPins, FramePayload::Hex(pins_hex))?;
        let init = Command::with_payload(Opcode::Init, FramePayload::Hex(driver_hex))?;
        let channel = self.channel()?;
        channel.send(&pins).await?;
        channel.send(&init).await
    }

    pub async fn clear_screen(&self) -> Result<()> {
        self.send_command(&Command::empty(Opcode::Clear)).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.send_command(&Command::empty(Opcode::Refresh)).await
    }

    /// Put the panel into deep sleep.
    pub async fn sleep(&self) -> Result<()> {
        self.send_command(&Command::empty(Opcode::Sleep)).await
    }

    /// Set the peripheral clock and display mode.
    ///
    /// Clock mode must be confirmed with
    /// [`TimeSync::confirm_full_refresh`]; otherwise nothing is sent.
    pub async fn sync_time(&self, sync: &TimeSync) -> Result<()> {
        let command = sync.to_command()?;
        self.send_command(&command).await?;
        tracing::info!("Time synced ({:?})", sync.mode());
        Ok(())
    }

    /// Send an operator console line such as `"0501"`. A blank line is a
    /// no-op.
    pub async fn send_raw_hex(&self, line: &str) -> Result<()> {
        match Command::from_hex_line(line)? {
            Some(command) => self.send_command(&command).await,
            None => Ok(()),
        }
    }

    /// Pass command bytes straight to the panel controller.
    pub async fn send_raw_command(&self, bytes: &[u8]) -> Result<()> {
        self.send_command(&Command::new(Opcode::SendCmd, Bytes::copy_from_slice(bytes)))
            .await
    }

    /// Pass data bytes straight to the panel controller.
    pub async fn send_raw_data(&self, bytes: &[u8]) -> Result<()> {
        self.send_command(&Command::new(Opcode::SendData, Bytes::copy_from_slice(bytes)))
            .await
    }

    pub async fn set_config(&self, config: &[u8]) -> Result<()> {
        self.send_command(&Command::new(Opcode::SetConfig, Bytes::copy_from_slice(config)))
            .await
    }

    pub async fn system_reset(&self) -> Result<()> {
        self.send_command(&Command::empty(Opcode::SysReset)).await
    }

    pub async fn system_sleep(&self) -> Result<()> {
        self.send_command(&Command::empty(Opcode::SysSleep)).await
    }

    pub async fn erase_config(&self) -> Result<()> {
        self.send_command(&Command::empty(Opcode::CfgErase)).await
    }

    /// Compare `mode` with the driver from the peripheral's config snapshot.
    pub fn check_image_fit(&self, mode: ColorMode) -> ImageFit {
        let driver = self
            .shared
            .lock()
            .connection
            .as_ref()
            .and_then(|c| c.status.snapshot())
            .and_then(|s| s.driver_model());
        match driver {
            Some(driver) if driver.color_mode == mode => ImageFit::Matches(driver),
            Some(driver) => ImageFit::Mismatch {
                driver,
                expected: driver.color_mode,
            },
            None => ImageFit::UnknownDriver,
        }
    }

    /// Stream one plane without refreshing.
    pub async fn send_plane(&self, plane: Plane, payload: Bytes) -> Result<TransferReport> {
        let (epoch, channel, status) = self.begin_transfer()?;
        let result = self.stream_plane(&channel, &status, plane, payload).await;
        self.shared.finish_transfer(epoch);
        result
    }

    /// Stream every plane of an encoded image, then send `REFRESH`.
    ///
    /// The first failed chunk aborts the image; no later plane and no
    /// `REFRESH` is sent. Resend the whole image to retry.
    pub async fn send_image(&self, mode: ColorMode, data: Bytes) -> Result<ImageReport> {
        let start = Instant::now();
        if let ImageFit::Mismatch { driver, expected } = self.check_image_fit(mode) {
            tracing::warn!(
                "Sending {:?} image to {} which expects {:?}",
                mode,
                driver.controller,
                expected
            );
        }

        let (epoch, channel, status) = self.begin_transfer()?;
        let mut planes = Vec::new();
        let mut result = Ok(());
        for (plane, payload) in ImagePlanes::split(mode, data) {
            match self.stream_plane(&channel, &status, plane, payload).await {
                Ok(report) => planes.push(report),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.shared.finish_transfer(epoch);
        result?;

        channel.send(&Command::empty(Opcode::Refresh)).await?;
        let report = ImageReport {
            planes,
            elapsed: start.elapsed(),
        };
        tracing::info!("Image sent in {:?}", report.elapsed);
        Ok(report)
    }

    fn begin_transfer(&self) -> Result<(u64, CommandChannel, Arc<DeviceStatus>)> {
        let mut slot = self.shared.lock();
        let (channel, status) = match &slot.connection {
            Some(c) if c.is_alive() => (c.channel.clone(), c.status.clone()),
            _ => return Err(EpdError::NotConnected),
        };
        let next = slot.state.on(LinkEvent::TransferStarted).ok_or_else(|| {
            EpdError::InvalidState(format!("cannot start a transfer while {}", slot.state))
        })?;
        slot.state = next;
        Ok((slot.epoch, channel, status))
    }

    async fn stream_plane(
        &self,
        channel: &CommandChannel,
        status: &DeviceStatus,
        plane: Plane,
        payload: Bytes,
    ) -> Result<TransferReport> {
        // MTU is fixed per job; updates apply to the next one.
        let job = TransferJob::new(payload, plane, status.mtu(), self.config.interleave_budget)?;
        transfer::transmit(channel, &job, |progress| {
            self.shared.emit(ClientEvent::Progress(progress));
        })
        .await
    }
}
