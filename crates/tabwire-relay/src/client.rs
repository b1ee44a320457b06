//! The control-plane link.
//!
//! [`Relay::run`] keeps one outbound WebSocket open to the control plane,
//! redialing with backoff when it drops. While connected it sends
//! heartbeats and metrics, and turns each `command` frame into a
//! [`Hub::call`] whose result goes back as a `response` frame.

use crate::backoff::Backoff;
use crate::compress::{self, Compressor};
use crate::dispatch::{self, CallTimeouts};
use crate::error::RelayError;
use crate::heartbeat::{self, MAX_MISSED_HEARTBEATS, MIN_PERIOD};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabwire_core::{
    BindPayload, CommandPayload, DeviceIdentity, HeartbeatPayload, LinkState, MetricsPayload,
    RelayEnvelope, RelayKind, ResponsePayload,
};
use tabwire_hub::Hub;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Shared-secret header sent when dialing.
pub const SECRET_HEADER: &str = "X-Tabwire-Secret";
/// Device identity header sent when dialing.
pub const CLIENT_ID_HEADER: &str = "X-Tabwire-Client-Id";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `ws://` or `wss://` URL of the control plane.
    pub url: String,
    pub secret: Option<String>,
    pub bind_token: Option<String>,
    /// Reported in heartbeats.
    pub version: String,
    pub heartbeat_interval: Duration,
    /// Longest silence from the control plane before the link is dropped.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub dial_timeout: Duration,
    /// `None` disables metrics frames.
    pub metrics_interval: Option<Duration>,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Failed dials in a row before giving up; zero retries forever.
    pub max_retries: u32,
    /// Pause before redialing after a session that was established.
    pub reconnect_delay: Duration,
    pub compression: bool,
    /// Frames at or below this many bytes are never compressed.
    pub compression_threshold: usize,
    pub default_call_timeout: Duration,
    pub call_timeouts: HashMap<String, Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: None,
            bind_token: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(45),
            write_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(15),
            metrics_interval: Some(Duration::from_secs(60)),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            max_retries: 0,
            reconnect_delay: Duration::from_secs(2),
            compression: true,
            compression_threshold: 1024,
            default_call_timeout: Duration::from_secs(30),
            call_timeouts: HashMap::new(),
        }
    }
}

/// Outbound client for the control plane.
pub struct Relay {
    config: RelayConfig,
    hub: Hub,
    identity: DeviceIdentity,
    timeouts: CallTimeouts,
    state: watch::Sender<LinkState>,
    reconnects: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig, hub: Hub, identity: DeviceIdentity) -> Self {
        let timeouts = CallTimeouts::new(config.default_call_timeout)
            .with_overrides(config.call_timeouts.clone());
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            hub,
            identity,
            timeouts,
            state,
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch link state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Sessions that have ended since start.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Keep the link up until `shutdown` fires or the retry ceiling is hit.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), RelayError> {
        let mut backoff = Backoff::new(
            self.config.base_backoff,
            self.config.max_backoff,
            self.config.max_retries,
        );

        loop {
            self.state.send_replace(LinkState::Connecting);
            let dialed = tokio::select! {
                _ = shutdown.cancelled() => break,
                dialed = self.dial() => dialed,
            };

            let delay = match dialed {
                Ok(socket) => {
                    backoff.reset();
                    self.state.send_replace(LinkState::Connected);
                    tracing::info!("Relay connected to {} as {}", self.config.url, self.identity);

                    let outcome = self
                        .serve(socket, &shutdown)
                        .instrument(tracing::info_span!("relay", client = %self.identity.client_id()))
                        .await;
                    self.state.send_replace(LinkState::Disconnected);
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    match outcome {
                        Ok(()) => {
                            tracing::info!("Relay session closed");
                            self.config.reconnect_delay
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!("Relay session ended: {}; redialing in {:?}", e, delay);
                            delay
                        }
                    }
                }
                Err(e) => {
                    self.state.send_replace(LinkState::Disconnected);
                    let delay = backoff.next_delay();
                    if backoff.exhausted() {
                        tracing::error!(
                            "Relay giving up on {} after {} attempts: {}",
                            self.config.url,
                            backoff.retries(),
                            e
                        );
                        return Err(RelayError::RetriesExhausted(backoff.retries()));
                    }
                    tracing::warn!(
                        "Relay dial to {} failed (attempt {}): {}; retrying in {:?}",
                        self.config.url,
                        backoff.retries(),
                        e,
                        delay
                    );
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        tracing::info!("Relay stopped");
        Ok(())
    }

    async fn dial(&self) -> Result<Socket, RelayError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(secret) = self.config.secret.as_deref().filter(|s| !s.is_empty()) {
            let value =
                HeaderValue::from_str(secret).map_err(|_| RelayError::InvalidHeader(SECRET_HEADER))?;
            headers.insert(SECRET_HEADER, value);
        }
        let client_id = HeaderValue::from_str(self.identity.client_id())
            .map_err(|_| RelayError::InvalidHeader(CLIENT_ID_HEADER))?;
        headers.insert(CLIENT_ID_HEADER, client_id);

        let (socket, _) = timeout(self.config.dial_timeout, connect_async(request))
            .await
            .map_err(|_| RelayError::DialTimeout(self.config.dial_timeout))??;
        Ok(socket)
    }

    async fn serve(self: &Arc<Self>, socket: Socket, shutdown: &CancellationToken) -> Result<(), RelayError> {
        let (sink, stream) = socket.split();
        let outbound = Arc::new(Outbound {
            writer: Mutex::new(Writer {
                sink,
                compressor: Compressor::new(
                    self.config.compression,
                    self.config.compression_threshold,
                ),
            }),
            client_id: self.identity.client_id().to_string(),
            write_timeout: self.config.write_timeout,
        });
        let session = shutdown.child_token();

        if let Some(token) = self.config.bind_token.as_ref().filter(|t| !t.is_empty()) {
            outbound
                .send(RelayKind::Bind, &BindPayload { token: token.clone() })
                .await?;
        }

        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop(Arc::clone(&outbound), session.clone()));
        let metrics = self.config.metrics_interval.map(|period| {
            tokio::spawn(Arc::clone(self).metrics_loop(Arc::clone(&outbound), session.clone(), period))
        });

        let result = self.read_loop(stream, &outbound, &session).await;

        session.cancel();
        let heartbeat_lost = match heartbeat.await {
            Ok(lost) => lost,
            Err(e) => {
                tracing::error!("Heartbeat task failed: {}", e);
                false
            }
        };
        if let Some(metrics) = metrics {
            if let Err(e) = metrics.await {
                tracing::error!("Metrics task failed: {}", e);
            }
        }
        outbound.close().await;

        result?;
        if heartbeat_lost {
            return Err(RelayError::HeartbeatLost(MAX_MISSED_HEARTBEATS));
        }
        Ok(())
    }

    /// Returns `true` if it gave up on the link.
    async fn heartbeat_loop(self: Arc<Self>, outbound: Arc<Outbound>, session: CancellationToken) -> bool {
        let payload = HeartbeatPayload {
            hostname: self.identity.hostname().to_string(),
            version: self.config.version.clone(),
            status: "online".to_string(),
            hardware_fingerprint: self.identity.fingerprint().to_string(),
        };
        let (outbound, payload) = (&*outbound, &payload);
        heartbeat::run_heartbeats(self.config.heartbeat_interval, &session, move || {
            outbound.send(RelayKind::Heartbeat, payload)
        })
        .await
    }

    async fn metrics_loop(
        self: Arc<Self>,
        outbound: Arc<Outbound>,
        session: CancellationToken,
        period: Duration,
    ) {
        let period = period.max(MIN_PERIOD);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let payload = MetricsPayload {
                connected_peers: self.hub.connection_count().await,
                pending_calls: self.hub.pending_calls(),
                uptime_secs: self.hub.uptime().as_secs(),
                reconnects: self.reconnects(),
                selector: self.hub.selector_name().to_string(),
            };
            if let Err(e) = outbound.send(RelayKind::Metrics, &payload).await {
                tracing::debug!("Metrics frame not sent: {}", e);
            }
        }
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut stream: SplitStream<Socket>,
        outbound: &Arc<Outbound>,
        session: &CancellationToken,
    ) -> Result<(), RelayError> {
        let read_timeout = self.config.read_timeout;

        loop {
            let next = tokio::select! {
                _ = session.cancelled() => return Ok(()),
                next = timeout(read_timeout, stream.next()) => next,
            };

            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Ok(()),
                Err(_) => return Err(RelayError::ReadTimeout(read_timeout)),
            };

            let text = match msg {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match compress::decompress(&bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Undecodable binary frame from control plane: {}", e);
                        continue;
                    }
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            let envelope: RelayEnvelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Malformed frame from control plane: {}", e);
                    continue;
                }
            };

            match envelope.kind {
                RelayKind::HeartbeatAck => {}
                RelayKind::Command => {
                    let relay = Arc::clone(self);
                    let outbound = Arc::clone(outbound);
                    let span = tracing::debug_span!("command", id = %envelope.id);
                    tokio::spawn(
                        contained(async move { relay.handle_command(envelope, outbound).await })
                            .instrument(span),
                    );
                }
                other => tracing::debug!("Ignoring {:?} frame from control plane", other),
            }
        }
    }

    async fn handle_command(&self, envelope: RelayEnvelope, outbound: Arc<Outbound>) {
        let request_id = envelope.id.clone();
        let result = match envelope.decode_payload::<CommandPayload>() {
            Ok(command) => dispatch::execute(&self.hub, &self.timeouts, command).await,
            Err(e) => {
                tracing::warn!("Malformed command {}: {}", request_id, e);
                Err(format!("invalid command payload: {e}"))
            }
        };

        let response = match result {
            Ok(data) => ResponsePayload::success(&request_id, data),
            Err(error) => ResponsePayload::failure(&request_id, error),
        };
        if let Err(e) = outbound.send(RelayKind::Response, &response).await {
            tracing::warn!("Could not deliver response for {}: {}", request_id, e);
        }
    }
}

struct Writer {
    sink: SplitSink<Socket, Message>,
    compressor: Compressor,
}

/// The single write path of a session; every frame takes the same lock.
struct Outbound {
    writer: Mutex<Writer>,
    client_id: String,
    write_timeout: Duration,
}

impl Outbound {
    async fn send<P: Serialize>(&self, kind: RelayKind, payload: &P) -> Result<(), RelayError> {
        let envelope = RelayEnvelope::new(
            Uuid::new_v4().to_string(),
            kind,
            self.client_id.as_str(),
            payload,
            Utc::now().timestamp_millis(),
        )?;
        let text = serde_json::to_string(&envelope)?;

        timeout(self.write_timeout, async {
            let mut writer = self.writer.lock().await;
            let frame = writer.compressor.encode(text)?;
            writer.sink.send(frame).await?;
            Ok::<(), RelayError>(())
        })
        .await
        .map_err(|_| RelayError::WriteTimeout(self.write_timeout))?
    }

    async fn close(&self) {
        let _ = timeout(self.write_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.sink.close().await
        })
        .await;
    }
}

/// Run `work`, logging instead of propagating a panic.
async fn contained<F: Future<Output = ()>>(work: F) {
    if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
        tracing::error!("Command handler panicked: {}", panic_message(panic.as_ref()));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
