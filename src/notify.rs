//! Notification demultiplexer.
//!
//! The first notification after every (re)connect is the peripheral's
//! config snapshot; everything after it is a UTF-8 status line. The
//! distinction is made by position only, never by content.
//!
//! ```
//! use std::sync::Arc;
//! use epd_link::notify::{DeviceStatus, NotificationDemux, NotificationEvent};
//!
//! let status = Arc::new(DeviceStatus::new(20));
//! let mut demux = NotificationDemux::new(status.clone());
//!
//! // "mtu=..." as the first message is still a snapshot.
//! assert!(matches!(demux.dispatch(b"mtu=99"), NotificationEvent::ConfigSnapshot(_)));
//! assert!(matches!(demux.dispatch(b"mtu=99"), NotificationEvent::StatusText { .. }));
//! assert_eq!(status.mtu(), 99);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::codec::HexCodec;
use crate::event::ClientEvent;
use crate::protocol::{DriverModel, CHUNK_OVERHEAD};
use crate::transport::NotificationStream;

/// Bytes 0..7 of the snapshot hold the pin map.
const PINS_LEN: usize = 7;
/// Byte 7 holds the driver id.
const DRIVER_OFFSET: usize = 7;
/// Byte 10, when present, extends the pin map.
const PIN_EXT_OFFSET: usize = 10;

/// The peripheral's pin/driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    raw: Bytes,
}

impl ConfigSnapshot {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            raw: Bytes::copy_from_slice(data),
        }
    }

    /// Pin map: bytes 0..7, plus byte 10 when the snapshot has one.
    pub fn pins(&self) -> Vec<u8> {
        let mut pins = self.raw[..self.raw.len().min(PINS_LEN)].to_vec();
        if let Some(&ext) = self.raw.get(PIN_EXT_OFFSET) {
            pins.push(ext);
        }
        pins
    }

    pub fn driver_id(&self) -> Option<u8> {
        self.raw.get(DRIVER_OFFSET).copied()
    }

    /// Pin map as hex, ready for a `SET_PINS` round trip.
    pub fn pins_hex(&self) -> String {
        HexCodec::encode(&self.pins())
    }

    pub fn driver_hex(&self) -> Option<String> {
        self.driver_id().map(|id| HexCodec::encode(&[id]))
    }

    pub fn raw_hex(&self) -> String {
        HexCodec::encode(&self.raw)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Known driver for the snapshot's driver id.
    pub fn driver_model(&self) -> Option<&'static DriverModel> {
        self.driver_id().and_then(DriverModel::lookup)
    }
}

/// A classified status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    /// `mtu=<int>`
    Mtu(usize),
    /// `t=<int>`
    RemoteTime(i64),
    /// Anything else.
    Text(String),
}

impl StatusLine {
    /// Classify a status line by prefix. A known prefix without a parsable
    /// number is plain text.
    pub fn parse(text: &str) -> Self {
        if let Some(mtu) = text.strip_prefix("mtu=").and_then(|v| v.trim().parse().ok()) {
            return StatusLine::Mtu(mtu);
        }
        if let Some(t) = text.strip_prefix("t=").and_then(|v| v.trim().parse().ok()) {
            return StatusLine::RemoteTime(t);
        }
        StatusLine::Text(text.to_string())
    }
}

/// One demultiplexed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    ConfigSnapshot(ConfigSnapshot),
    /// A status line, verbatim and classified. An MTU the peripheral
    /// cannot use is classified as plain text.
    StatusText { text: String, line: StatusLine },
}

/// Live peripheral state fed by notifications and read by the client.
#[derive(Debug)]
pub struct DeviceStatus {
    mtu: AtomicUsize,
    snapshot: Mutex<Option<ConfigSnapshot>>,
}

impl DeviceStatus {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu: AtomicUsize::new(mtu),
            snapshot: Mutex::new(None),
        }
    }

    /// Current transport message size ceiling.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Acquire)
    }

    fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Release);
    }

    /// Last config snapshot received on this connection.
    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_snapshot(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }
}

/// Per-connection demultiplexer. A new one (counter at 0) is created on
/// every connect.
pub struct NotificationDemux {
    sequence: u64,
    status: Arc<DeviceStatus>,
}

impl NotificationDemux {
    pub fn new(status: Arc<DeviceStatus>) -> Self {
        Self {
            sequence: 0,
            status,
        }
    }

    /// Notifications seen so far.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Classify one notification and apply its side effects.
    pub fn dispatch(&mut self, data: &[u8]) -> NotificationEvent {
        let index = self.sequence;
        self.sequence += 1;

        if index == 0 {
            let snapshot = ConfigSnapshot::parse(data);
            self.status.set_snapshot(snapshot.clone());
            return NotificationEvent::ConfigSnapshot(snapshot);
        }

        let text = String::from_utf8_lossy(data).into_owned();
        let line = match StatusLine::parse(&text) {
            StatusLine::Mtu(mtu) if mtu > CHUNK_OVERHEAD => {
                self.status.set_mtu(mtu);
                StatusLine::Mtu(mtu)
            }
            StatusLine::Mtu(mtu) => {
                tracing::warn!("Ignoring unusable MTU {} from peripheral", mtu);
                StatusLine::Text(text.clone())
            }
            other => other,
        };
        NotificationEvent::StatusText { text, line }
    }

    /// Consume the notification stream until it closes, publishing events.
    pub(crate) async fn run(
        mut self,
        mut stream: NotificationStream,
        events: broadcast::Sender<ClientEvent>,
    ) {
        while let Some(data) = stream.recv().await {
            match self.dispatch(&data) {
                NotificationEvent::ConfigSnapshot(snapshot) => {
                    tracing::info!(
                        "Received config: {} (pins {}, driver {:?})",
                        snapshot.raw_hex(),
                        snapshot.pins_hex(),
                        snapshot.driver_hex()
                    );
                    let _ = events.send(ClientEvent::ConfigSnapshot(snapshot));
                }
                NotificationEvent::StatusText { text, line } => {
                    tracing::info!("<= {}", text);
                    let _ = events.send(ClientEvent::Status(text));
                    match line {
                        StatusLine::Mtu(mtu) => {
                            tracing::info!("MTU updated to {}", mtu);
                            let _ = events.send(ClientEvent::MtuUpdated(mtu));
                        }
                        StatusLine::RemoteTime(t) => {
                            tracing::debug!("Remote time: {}", t);
                            let _ = events.send(ClientEvent::RemoteTime(t));
                        }
                        StatusLine::Text(_) => {}
                    }
                }
            }
        }
        tracing::debug!(
            "Notification stream closed after {} messages",
            self.sequence
        );
    }
}
