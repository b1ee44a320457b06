//! Peer-facing messages.
//!
//! Every frame exchanged with a browser tab is one JSON object of the form
//! `{"type": ..., "data": ...}`. The tab answers `api_call` frames with
//! `api_response` frames carrying the same `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single frame on the peer socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    /// Ask the peer to run an internal API.
    ApiCall(ApiCall),
    /// The peer's answer to an `api_call`.
    ApiResponse(ApiResponse),
    /// Application-level liveness probe.
    Ping,
    /// Answer to `ping`.
    Pong,
    /// Unsolicited push; no answer expected.
    Cmd(PushCommand),
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short name of the frame type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ApiCall(_) => "api_call",
            Envelope::ApiResponse(_) => "api_response",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::Cmd(_) => "cmd",
        }
    }
}

/// Request half of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub body: Value,
}

/// Response half of a call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub err_code: i64,
    #[serde(default)]
    pub err_msg: String,
}

impl ApiResponse {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            ..Default::default()
        }
    }

    pub fn error(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Value::Null,
            err_code: code,
            err_msg: message.into(),
        }
    }

    /// A non-zero `errCode` means the peer reported a failure.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.err_code != 0 {
            return Err(RemoteError {
                code: self.err_code,
                message: self.err_msg,
            });
        }
        Ok(self.data)
    }
}

/// Fire-and-forget command pushed to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushCommand {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// A failure reported by the peer that executed a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
}
