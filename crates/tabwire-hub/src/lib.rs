//! Request/response calls into browser tabs over WebSocket.
//!
//! Tabs connect to the endpoint served by [`server::run`] and register with a
//! [`Hub`]. [`Hub::call`] picks one of them with a [`Selector`], sends an
//! `api_call` frame and waits for the matching `api_response`.

pub mod connection;
mod error;
pub mod global;
mod hub;
pub mod selector;
pub mod server;

pub use connection::{Connection, ConnectionConfig, ConnectionId};
pub use error::{CallError, NoPeerAvailable, SendError};
pub use hub::{BroadcastReport, Hub, HubConfig};
pub use selector::{LeastActiveCalls, RoundRobin, Selector, SelectorKind, UniformRandom, WeightedRandom};
