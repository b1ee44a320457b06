//! Device identity presented to the control plane.
//!
//! The fingerprint is a SHA-256 over stable host facts, so the same machine
//! reports the same value across restarts without storing anything.

use sha2::{Digest, Sha256};
use std::fmt;

/// Who this process is, from the control plane's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    client_id: String,
    hostname: String,
    fingerprint: String,
}

impl DeviceIdentity {
    /// Create an identity from known parts.
    pub fn new(
        client_id: impl Into<String>,
        hostname: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            hostname: hostname.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Inspect the current host.
    ///
    /// Without a configured `client_id`, one is derived from the fingerprint.
    pub fn detect(client_id: Option<String>) -> Self {
        let hostname = local_hostname();
        let machine_id = std::fs::read_to_string("/etc/machine-id").unwrap_or_default();
        let fingerprint = fingerprint_of(
            &hostname,
            machine_id.trim(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        let client_id = client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derived_client_id(&fingerprint));
        Self {
            client_id,
            hostname,
            fingerprint,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Hex-encoded SHA-256 fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client_id, self.hostname)
    }
}

fn fingerprint_of(hostname: &str, machine_id: &str, os: &str, arch: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [hostname, machine_id, os, arch] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn derived_client_id(fingerprint: &str) -> String {
    format!("dev-{}", &fingerprint[..16.min(fingerprint.len())])
}

fn local_hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
