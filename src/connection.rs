//! The live connection and its command channel.
//!
//! A [`Connection`] owns every handle of one link. Dropping it marks the
//! command channel dead and stops the per-connection tasks (disconnect
//! watcher and notification demultiplexer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::codec::HexCodec;
use crate::error::{EpdError, Result};
use crate::interleave::WriteMode;
use crate::notify::DeviceStatus;
use crate::protocol::Command;
use crate::transport::{CharacteristicHandle, DeviceHandle, ServiceHandle, Transport};

/// Write access to the command/data characteristic.
///
/// Cloning is cheap; all clones share the liveness flag. Once the link
/// drops, every write fails with `Disconnected` without touching the
/// transport.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    characteristic: CharacteristicHandle,
    alive: Arc<AtomicBool>,
}

impl CommandChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        characteristic: CharacteristicHandle,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            characteristic,
            alive,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn characteristic(&self) -> &CharacteristicHandle {
        &self.characteristic
    }

    /// Write one frame with the given delivery guarantee.
    pub async fn write(&self, frame: &[u8], mode: WriteMode) -> Result<()> {
        if !self.is_alive() {
            return Err(EpdError::Disconnected);
        }
        tracing::debug!("=> {} ({:?})", HexCodec::encode(frame), mode);
        match mode {
            WriteMode::Confirmed => {
                self.transport
                    .write_with_response(&self.characteristic, frame)
                    .await
            }
            WriteMode::Unconfirmed => {
                self.transport
                    .write_without_response(&self.characteristic, frame)
                    .await
            }
        }
    }

    /// Send a command as a confirmed write.
    pub async fn send(&self, command: &Command) -> Result<()> {
        tracing::trace!("Sending {}", command.opcode());
        self.write(&command.encode(), WriteMode::Confirmed).await
    }
}

/// Everything belonging to one established link.
pub(crate) struct Connection {
    pub(crate) device: DeviceHandle,
    pub(crate) service: ServiceHandle,
    pub(crate) channel: CommandChannel,
    pub(crate) version_characteristic: Option<CharacteristicHandle>,
    pub(crate) firmware_version: u8,
    pub(crate) status: Arc<DeviceStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(
        device: DeviceHandle,
        service: ServiceHandle,
        channel: CommandChannel,
        version_characteristic: Option<CharacteristicHandle>,
        firmware_version: u8,
        status: Arc<DeviceStatus>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            device,
            service,
            channel,
            version_characteristic,
            firmware_version,
            status,
            tasks,
        }
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.channel.mark_dead();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_COMMAND_UUID, DEFAULT_SERVICE_UUID};
    use crate::protocol::Opcode;
    use crate::transport::MemoryTransport;

    async fn connected_channel() -> (MemoryTransport, CommandChannel) {
        let transport = MemoryTransport::new();
        let device = transport.request_device(DEFAULT_SERVICE_UUID).await.unwrap();
        transport.connect(&device).await.unwrap();
        let channel = CommandChannel::new(
            Arc::new(transport.clone()),
            CharacteristicHandle {
                service: DEFAULT_SERVICE_UUID,
                uuid: DEFAULT_COMMAND_UUID,
            },
            Arc::new(AtomicBool::new(true)),
        );
        (transport, channel)
    }

    #[tokio::test]
    async fn test_send_is_confirmed() {
        let (transport, channel) = connected_channel().await;
        channel.send(&Command::empty(Opcode::Init)).await.unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].mode, WriteMode::Confirmed);
        assert_eq!(&writes[0].data[..], &[0x01]);
    }

    #[tokio::test]
    async fn test_dead_channel_never_writes() {
        let (transport, channel) = connected_channel().await;
        let clone = channel.clone();
        channel.mark_dead();

        assert!(!clone.is_alive());
        let result = clone.write(&[0x05], WriteMode::Unconfirmed).await;
        assert!(matches!(result, Err(EpdError::Disconnected)));
        assert!(transport.writes().is_empty());
    }
}
