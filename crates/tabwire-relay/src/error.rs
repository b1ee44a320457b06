use std::time::Duration;
use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("gave up after {0} failed connection attempts")]
    RetriesExhausted(u32),
    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("missed {0} heartbeats in a row")]
    HeartbeatLost(u32),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}
