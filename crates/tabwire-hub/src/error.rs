//! Hub error types.

use crate::connection::ConnectionId;
use std::time::Duration;
use tabwire_core::RemoteError;

/// Why a frame could not be queued for a peer.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    QueueFull,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The registry had nobody to serve a call.
///
/// The message is what end users see, so it says what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, thiserror::Error)]
#[error("no browser tab is connected; open the web app to enable remote calls")]
pub struct NoPeerAvailable;

/// Failure of [`Hub::call`](crate::Hub::call).
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    NoPeer(#[from] NoPeerAvailable),
    #[error("call {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("failed to send call: {0}")]
    Send(#[from] SendError),
    #[error("peer {0} disconnected before answering")]
    PeerDisconnected(ConnectionId),
}

impl CallError {
    pub fn is_no_peer(&self) -> bool {
        matches!(self, CallError::NoPeer(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}
