//! Turning control-plane commands into local hub calls.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tabwire_core::{ACTION_API_CALL, ApiCallCommand, CommandPayload};
use tabwire_hub::{CallError, Hub};

/// Keys known to run long in the tab, with their timeout in seconds.
const SLOW_KEYS: &[(&str, u64)] = &[
    ("file:upload", 120),
    ("file:batch_download", 90),
    ("share:create", 60),
];

/// Call timeout per API key.
#[derive(Debug, Clone)]
pub struct CallTimeouts {
    default: Duration,
    per_key: HashMap<String, Duration>,
}

impl CallTimeouts {
    /// Built-in table with `default` for everything else.
    pub fn new(default: Duration) -> Self {
        let per_key = SLOW_KEYS
            .iter()
            .map(|(key, secs)| (key.to_string(), Duration::from_secs(*secs)))
            .collect();
        Self { default, per_key }
    }

    /// Add or replace entries.
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (String, Duration)>) -> Self {
        self.per_key.extend(overrides);
        self
    }

    pub fn for_key(&self, key: &str) -> Duration {
        self.per_key.get(key).copied().unwrap_or(self.default)
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Run a command against the hub.
///
/// The error string is what the control plane shows its user.
pub async fn execute(hub: &Hub, timeouts: &CallTimeouts, command: CommandPayload) -> Result<Value, String> {
    match command.action.as_str() {
        ACTION_API_CALL => {
            let call: ApiCallCommand = serde_json::from_value(command.data)
                .map_err(|e| format!("invalid api_call data: {e}"))?;
            let timeout = timeouts.for_key(&call.key);
            tracing::debug!("Relaying {} with timeout {:?}", call.key, timeout);
            hub.call(&call.key, call.body, timeout)
                .await
                .map_err(|e| describe(&call.key, e))
        }
        other => Err(format!("unsupported action: {other}")),
    }
}

fn describe(key: &str, err: CallError) -> String {
    match err {
        CallError::NoPeer(no_peer) => no_peer.to_string(),
        other => {
            tracing::warn!("Relayed call {} failed: {}", key, other);
            other.to_string()
        }
    }
}
