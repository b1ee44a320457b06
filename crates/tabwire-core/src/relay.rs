//! Control-plane messages.
//!
//! The relay speaks a second, flatter envelope with the remote control plane.
//! `payload` stays raw JSON until the receiver knows which `type` it is.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only command action currently understood.
pub const ACTION_API_CALL: &str = "api_call";

/// Message type on the control-plane link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Bind,
    Heartbeat,
    HeartbeatAck,
    Command,
    Response,
    Metrics,
    /// Anything this build does not know about.
    #[serde(other)]
    Unknown,
}

/// One frame on the control-plane link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RelayKind,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl RelayEnvelope {
    pub fn new<P: Serialize>(
        id: impl Into<String>,
        kind: RelayKind,
        client_id: impl Into<String>,
        payload: &P,
        timestamp: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            kind,
            client_id: client_id.into(),
            payload: serde_json::to_value(payload)?,
            timestamp,
        })
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Sent once after connecting when a bind token is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub hostname: String,
    pub version: String,
    pub status: String,
    pub hardware_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

/// `data` of an [`ACTION_API_CALL`] command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallCommand {
    pub key: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Periodic snapshot of local bridge health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub connected_peers: usize,
    pub pending_calls: usize,
    pub uptime_secs: u64,
    pub reconnects: u64,
    pub selector: String,
}
