//! # epd-link
//!
//! Host-side driver for battery-powered e-paper displays reached over a
//! BLE GATT link.
//!
//! The crate owns the device command protocol and the chunked image
//! transfer engine. Pixel encoding, image loading and any UI live outside;
//! the engine receives opaque bytes per image plane.
//!
//! ## Architecture
//!
//! - **Transport** (`transport`): the capability boundary to the wireless
//!   stack, with an in-process [`MemoryTransport`] for tests
//! - **Command plane** (`protocol`): one opcode byte + payload per write
//! - **Image plane** (`transfer`): tagged `WRITE_IMG` chunks, mostly
//!   unconfirmed with a confirmed write every `interleave_budget + 1` chunks
//! - **Notifications** (`notify`): config snapshot first, status lines after
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use epd_link::{ClientEvent, ColorMode, EpdClient};
//!
//! #[tokio::main]
//! async fn main() -> epd_link::Result<()> {
//!     let client = EpdClient::builder(Arc::new(my_ble_transport()))
//!         .interleave_budget(50)
//!         .build()?;
//!
//!     let mut events = client.subscribe();
//!     client.connect().await?;
//!
//!     client.send_image(ColorMode::ThreeColor, encoded_image()).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::Status(line) = event {
//!             println!("{}", line);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod interleave;
pub mod notify;
pub mod protocol;
pub mod state;
pub mod transfer;
pub mod transport;

mod client;
mod connection;

pub use client::{ConnectionInfo, EpdClient, EpdClientBuilder, ImageFit};
pub use config::LinkConfig;
pub use connection::CommandChannel;
pub use error::{EpdError, Result};
pub use event::ClientEvent;
pub use protocol::{ClockMode, ColorMode, Command, Opcode, TimeSync};
pub use state::LinkState;
pub use transfer::{ImageReport, Plane, TransferProgress, TransferReport};
pub use transport::{MemoryTransport, Transport};
