//! Outbound link from a tabwire host to a remote control plane.
//!
//! The control plane cannot reach the browser tabs directly, so the relay
//! dials out, keeps the connection alive, and forwards each command it
//! receives into the local [`tabwire_hub::Hub`].

pub mod backoff;
mod client;
pub mod compress;
pub mod dispatch;
mod error;
pub mod heartbeat;

pub use client::{CLIENT_ID_HEADER, Relay, RelayConfig, SECRET_HEADER};
pub use dispatch::CallTimeouts;
pub use error::RelayError;
