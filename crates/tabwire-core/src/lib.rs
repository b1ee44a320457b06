//! Core types for tabwire.
//!
//! This crate holds the wire envelopes spoken with browser peers and with the
//! remote control plane, the device identity sent when dialing out, and the
//! correlation table that turns an asynchronous reply into an awaited result.

mod envelope;
mod identity;
mod pending;
mod relay;

pub use envelope::{ApiCall, ApiResponse, Envelope, PushCommand, RemoteError};
pub use identity::DeviceIdentity;
pub use pending::{PendingCall, PendingCalls};
pub use relay::{
    ACTION_API_CALL, ApiCallCommand, BindPayload, CommandPayload, HeartbeatPayload, MetricsPayload,
    RelayEnvelope, RelayKind, ResponsePayload,
};

use std::fmt;

/// Lifecycle of the outbound control-plane link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No socket; waiting for the next dial.
    #[default]
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Socket established and serving.
    Connected,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(s)
    }
}
