//! Connection lifecycle states.
//!
//! ```text
//! Idle ─Request─► Requesting ─DeviceSelected─► Connecting ─Connected─►
//! DiscoveringServices ─ServicesDiscovered─► ReadingVersion ─Subscribed─► Ready
//! Ready ─TransferStarted─► Streaming ─TransferFinished─► Ready
//! any ─Failed / Disconnected─► Idle
//! ```
//!
//! Only the pairs above are legal; [`LinkState::on`] returns `None` for
//! anything else.

use std::fmt;

/// Where the link is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Requesting,
    Connecting,
    DiscoveringServices,
    ReadingVersion,
    Ready,
    /// A chunked transfer holds the command channel.
    Streaming,
}

/// Inputs to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    Request,
    DeviceSelected,
    Connected,
    ServicesDiscovered,
    Subscribed,
    TransferStarted,
    TransferFinished,
    Failed,
    Disconnected,
}

impl LinkState {
    /// Next state for `event`, or `None` if the pair is illegal.
    pub fn on(self, event: LinkEvent) -> Option<LinkState> {
        use LinkEvent as E;
        use LinkState as S;

        match (self, event) {
            (_, E::Disconnected) => Some(S::Idle),
            (S::Idle, E::Failed) => None,
            (_, E::Failed) => Some(S::Idle),

            (S::Idle, E::Request) => Some(S::Requesting),
            (S::Requesting, E::DeviceSelected) => Some(S::Connecting),
            (S::Connecting, E::Connected) => Some(S::DiscoveringServices),
            (S::DiscoveringServices, E::ServicesDiscovered) => Some(S::ReadingVersion),
            (S::ReadingVersion, E::Subscribed) => Some(S::Ready),
            (S::Ready, E::TransferStarted) => Some(S::Streaming),
            (S::Streaming, E::TransferFinished) => Some(S::Ready),

            _ => None,
        }
    }

    /// Commands may be written.
    #[inline]
    pub fn is_ready(self) -> bool {
        matches!(self, LinkState::Ready | LinkState::Streaming)
    }

    /// A connect attempt is in progress.
    #[inline]
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            LinkState::Requesting
                | LinkState::Connecting
                | LinkState::DiscoveringServices
                | LinkState::ReadingVersion
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
