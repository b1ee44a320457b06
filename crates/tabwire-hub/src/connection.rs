//! One live WebSocket session with a browser tab.
//!
//! A [`Connection`] is shared between the hub (which queues frames on it) and
//! two pumps: the outbound pump drains the bounded queue and sends periodic
//! pings; the inbound pump decodes frames and routes call responses back to
//! the hub. Whichever pump fails first closes the connection, which stops
//! the other one.

use crate::Hub;
use crate::error::SendError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tabwire_core::Envelope;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;

/// Process-unique connection number.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shortest ping period the write pump will run; zero would panic `interval_at`.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
    /// How often the outbound pump pings the peer.
    pub ping_interval: Duration,
    /// Maximum silence tolerated between pongs.
    pub read_timeout: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: Duration::from_secs(50),
            read_timeout: Duration::from_secs(60),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// A registered peer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    name: String,
    outbound: mpsc::Sender<Message>,
    active_calls: AtomicUsize,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            outbound,
            active_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Label used for logs and for weighted selection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls currently waiting on this peer.
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Acquire)
    }

    /// Count a call against this peer until the guard is dropped.
    pub fn begin_call(&self) -> ActiveCallGuard<'_> {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
        ActiveCallGuard {
            counter: &self.active_calls,
        }
    }

    /// Queue an envelope without waiting.
    pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let text = envelope.to_json()?;
        self.send_text(text.into())
    }

    pub(crate) fn send_text(&self, text: Utf8Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound
            .try_send(Message::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Mark the connection closed. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

/// Decrements the active-call count on drop.
#[derive(Debug)]
pub struct ActiveCallGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for ActiveCallGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Run both pumps for `conn` until either stops, then unregister it.
pub async fn serve<S>(
    conn: Arc<Connection>,
    outbound_rx: mpsc::Receiver<Message>,
    ws: WebSocketStream<S>,
    hub: Hub,
    config: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let writer = tokio::spawn(write_pump(
        Arc::clone(&conn),
        outbound_rx,
        sink,
        config.ping_interval,
    ));

    read_pump(&conn, stream, &hub, config.read_timeout).await;

    conn.close();
    hub.unregister(conn.id());
    if let Err(e) = writer.await {
        tracing::warn!("Write pump for connection {} panicked: {}", conn.id(), e);
    }
    tracing::info!("Connection {} ({}) closed", conn.id(), conn.name());
}

async fn write_pump<S>(
    conn: Arc<Connection>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    ping_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping_interval = ping_interval.max(MIN_PING_INTERVAL);
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = conn.closed() => break,

            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("Write to connection {} failed: {}", conn.id(), e);
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    tracing::debug!("Ping to connection {} failed: {}", conn.id(), e);
                    break;
                }
            }
        }
    }

    conn.close();
    let _ = sink.close().await;
}

async fn read_pump<S>(
    conn: &Connection,
    mut stream: SplitStream<WebSocketStream<S>>,
    hub: &Hub,
    read_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + read_timeout;

    loop {
        let next = tokio::select! {
            _ = conn.closed() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!("Read from connection {} failed: {}", conn.id(), e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(
                    "Connection {} missed its read deadline of {:?}",
                    conn.id(),
                    read_timeout
                );
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let envelope = match Envelope::from_json(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Invalid frame from connection {}: {}", conn.id(), e);
                        continue;
                    }
                };
                match envelope {
                    Envelope::ApiResponse(resp) => {
                        let id = resp.id.clone();
                        if !hub.dispatch_response(resp) {
                            tracing::debug!("Dropped late or unknown response {}", id);
                        }
                    }
                    Envelope::Ping => {
                        deadline = Instant::now() + read_timeout;
                        if let Err(e) = conn.send(&Envelope::Pong) {
                            tracing::debug!("Could not answer ping on {}: {}", conn.id(), e);
                        }
                    }
                    Envelope::Pong => deadline = Instant::now() + read_timeout,
                    other => {
                        tracing::warn!(
                            "Unexpected {} frame from connection {}",
                            other.kind(),
                            conn.id()
                        );
                    }
                }
            }
            Message::Pong(_) => deadline = Instant::now() + read_timeout,
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::warn!("Ignoring binary frame from connection {}", conn.id());
            }
            Message::Ping(_) | Message::Frame(_) => {}
        }
    }
}
