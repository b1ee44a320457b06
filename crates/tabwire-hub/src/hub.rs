//! The registry of connected peers and the call machinery on top of it.

use crate::connection::{Connection, ConnectionConfig, ConnectionId};
use crate::error::CallError;
use crate::selector::{Selector, SelectorKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabwire_core::{ApiCall, ApiResponse, Envelope, PendingCalls, PushCommand};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Utf8Bytes;

type Registry = Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>;

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub selector: SelectorKind,
    /// Per-peer weights for [`SelectorKind::WeightedRandom`], keyed by name.
    pub weights: HashMap<String, u32>,
    /// Timeout callers use when they have no better idea.
    pub default_call_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            selector: SelectorKind::default(),
            weights: HashMap::new(),
            default_call_timeout: Duration::from_secs(30),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Outcome of a fan-out send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

enum RegistryEvent {
    Register(Arc<Connection>, oneshot::Sender<bool>),
    Unregister(ConnectionId),
}

struct HubInner {
    registry: Registry,
    events: mpsc::UnboundedSender<RegistryEvent>,
    pending: PendingCalls<ApiResponse>,
    selector: Box<dyn Selector>,
    config: HubConfig,
    started: Instant,
}

/// Handle to the peer registry.
///
/// Cloning is cheap; every clone talks to the same registry. Construct one
/// per process and pass it to whoever needs to reach the browser.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub using the configured selector.
    ///
    /// Must be called inside a Tokio runtime: the registry task is spawned here.
    pub fn new(config: HubConfig) -> Self {
        let selector = config.selector.build(config.weights.clone());
        Self::with_selector(config, selector)
    }

    /// Create a hub with an explicit selection strategy.
    pub fn with_selector(config: HubConfig, selector: Box<dyn Selector>) -> Self {
        let registry: Registry = Arc::default();
        let (events, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_registry(Arc::clone(&registry), events_rx));

        tracing::debug!("Hub started with {} selector", selector.name());

        Self {
            inner: Arc::new(HubInner {
                registry,
                events,
                pending: PendingCalls::new(),
                selector,
                config,
                started: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn selector_name(&self) -> &'static str {
        self.inner.selector.name()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Add a connection. Resolves once it is visible to callers.
    ///
    /// Returns `false` if this connection was already registered.
    pub async fn register(&self, conn: Arc<Connection>) -> bool {
        let (ack, ack_rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(RegistryEvent::Register(conn, ack))
            .is_err()
        {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Remove a connection. Takes effect asynchronously.
    pub fn unregister(&self, id: ConnectionId) {
        let _ = self.inner.events.send(RegistryEvent::Unregister(id));
    }

    /// Snapshot of live connections, ordered by ID.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let registry = self.inner.registry.read().await;
        let mut conns: Vec<_> = registry.values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Calls sent and still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Ask a peer to run `key` with `body` and wait for its answer.
    pub async fn call(&self, key: &str, body: Value, timeout: Duration) -> Result<Value, CallError> {
        let conn = {
            let snapshot = self.connections().await;
            Arc::clone(self.inner.selector.select(&snapshot)?)
        };

        let _active = conn.begin_call();
        let mut pending = self.inner.pending.register();
        let request = Envelope::ApiCall(ApiCall {
            id: pending.id().to_string(),
            key: key.to_string(),
            body,
        });
        conn.send(&request)?;

        tracing::debug!(
            "Call {} ({}) sent to connection {}",
            pending.id(),
            key,
            conn.id()
        );

        let response = tokio::select! {
            biased;
            response = pending.recv() => response,
            _ = conn.closed() => None,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!("Call {} ({}) timed out after {:?}", pending.id(), key, timeout);
                return Err(CallError::Timeout {
                    key: key.to_string(),
                    timeout,
                });
            }
        };

        match response {
            Some(resp) => Ok(resp.into_result()?),
            None => Err(CallError::PeerDisconnected(conn.id())),
        }
    }

    /// Route a peer's answer to the waiting caller.
    ///
    /// Returns `false` if nobody is waiting for it any more.
    pub fn dispatch_response(&self, response: ApiResponse) -> bool {
        let id = response.id.clone();
        self.inner.pending.resolve(&id, response)
    }

    /// Queue `envelope` on every live peer.
    ///
    /// Peers whose queue is full or closed are skipped and counted as dropped.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<BroadcastReport, serde_json::Error> {
        let text: Utf8Bytes = envelope.to_json()?.into();
        let mut report = BroadcastReport::default();
        for conn in self.connections().await {
            match conn.send_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!("Broadcast to connection {} dropped: {}", conn.id(), e);
                    report.dropped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Push an unsolicited command to every peer.
    pub async fn push_command(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let envelope = Envelope::Cmd(PushCommand {
            action: action.into(),
            payload,
        });
        self.broadcast(&envelope).await
    }
}

async fn run_registry(registry: Registry, mut events: mpsc::UnboundedReceiver<RegistryEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::Register(conn, ack) => {
                let mut map = registry.write().await;
                let fresh = !map.contains_key(&conn.id());
                if fresh {
                    tracing::info!(
                        "Registered connection {} ({}), {} live",
                        conn.id(),
                        conn.name(),
                        map.len() + 1
                    );
                    map.insert(conn.id(), conn);
                } else {
                    tracing::warn!("Connection {} registered twice", conn.id());
                }
                let _ = ack.send(fresh);
            }
            RegistryEvent::Unregister(id) => {
                let mut map = registry.write().await;
                if map.remove(&id).is_some() {
                    tracing::info!("Unregistered connection {}, {} live", id, map.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::LeastActiveCalls;
    use serde_json::json;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;

    /// Answers every call by echoing its body, after a delay derived from the body.
    fn echo_peer(hub: Hub, mut rx: mpsc::Receiver<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Ok(Envelope::ApiCall(call)) = Envelope::from_json(msg.to_text().unwrap()) else {
                    continue;
                };
                let hub = hub.clone();
                tokio::spawn(async move {
                    let delay = call.body["n"].as_u64().unwrap_or(0) % 7;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    hub.dispatch_response(ApiResponse::ok(call.id, call.body));
                });
            }
        })
    }

    async fn hub_with_peer() -> (Hub, Arc<Connection>, mpsc::Receiver<Message>) {
        let hub = Hub::new(HubConfig::default());
        let (conn, rx) = Connection::new("tab", 256);
        assert!(hub.register(Arc::clone(&conn)).await);
        (hub, conn, rx)
    }

    #[tokio::test]
    async fn call_without_peers_fails_fast() {
        let hub = Hub::new(HubConfig::default());
        let err = hub
            .call("user:info", Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_no_peer());
        assert_eq!(hub.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_answer() {
        let (hub, _conn, rx) = hub_with_peer().await;
        let _peer = echo_peer(hub.clone(), rx);

        let calls: Vec<_> = (0..64u64)
            .map(|n| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    let result = hub
                        .call("echo", json!({"n": n}), Duration::from_secs(5))
                        .await
                        .unwrap();
                    (n, result)
                })
            })
            .collect();

        for call in calls {
            let (n, result) = call.await.unwrap();
            assert_eq!(result, json!({"n": n}));
        }
        assert_eq!(hub.pending_calls(), 0);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (hub, conn, _rx) = hub_with_peer().await;

        let started = Instant::now();
        let err = hub
            .call("key:x", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert_eq!(hub.pending_calls(), 0);
        assert_eq!(conn.active_calls(), 0);
    }

    #[tokio::test]
    async fn abandoned_calls_do_not_leak() {
        let (hub, _conn, _rx) = hub_with_peer().await;

        let calls: Vec<_> = (0..200)
            .map(|_| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    hub.call("never", Value::Null, Duration::from_millis(10)).await
                })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().unwrap_err().is_timeout());
        }
        assert_eq!(hub.pending_calls(), 0);
    }

    #[tokio::test]
    async fn remote_error_is_returned() {
        let (hub, _conn, mut rx) = hub_with_peer().await;
        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let Envelope::ApiCall(call) = Envelope::from_json(msg.to_text().unwrap()).unwrap()
                else {
                    panic!("expected api_call");
                };
                hub.dispatch_response(ApiResponse::error(call.id, 500, "boom"));
            })
        };

        let err = hub
            .call("fails", Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        responder.await.unwrap();

        match err {
            CallError::Remote(remote) => {
                assert_eq!(remote.code, 500);
                assert_eq!(remote.message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn duplicate_response_is_ignored() {
        let (hub, _conn, mut rx) = hub_with_peer().await;
        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let Envelope::ApiCall(call) = Envelope::from_json(msg.to_text().unwrap()).unwrap()
                else {
                    panic!("expected api_call");
                };
                let first = hub.dispatch_response(ApiResponse::ok(call.id.clone(), json!(1)));
                let second = hub.dispatch_response(ApiResponse::ok(call.id, json!(2)));
                (first, second)
            })
        };

        let value = hub.call("once", Value::Null, Duration::from_secs(5)).await.unwrap();
        let (first, second) = responder.await.unwrap();
        assert_eq!(value, json!(1));
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn peer_lost_mid_call_resolves() {
        let (hub, conn, mut rx) = hub_with_peer().await;
        let killer = tokio::spawn(async move {
            let _ = rx.recv().await;
            conn.close();
        });

        let err = hub
            .call("slow", Value::Null, Duration::from_secs(30))
            .await
            .unwrap_err();
        killer.await.unwrap();
        assert!(matches!(err, CallError::PeerDisconnected(_)));
        assert_eq!(hub.pending_calls(), 0);
    }

    #[tokio::test]
    async fn full_queue_fails_immediately() {
        let hub = Hub::new(HubConfig::default());
        let (conn, _rx) = Connection::new("stuck", 1);
        hub.register(Arc::clone(&conn)).await;
        conn.send(&Envelope::Ping).unwrap();

        let err = hub
            .call("any", Value::Null, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Send(crate::SendError::QueueFull)));
        assert_eq!(hub.pending_calls(), 0);
        assert_eq!(conn.active_calls(), 0);
    }

    #[tokio::test]
    async fn register_is_idempotent_and_unregister_removes() {
        let (hub, conn, _rx) = hub_with_peer().await;
        assert!(!hub.register(Arc::clone(&conn)).await);
        assert_eq!(hub.connection_count().await, 1);

        hub.unregister(conn.id());
        hub.unregister(conn.id());
        // Registration round-trips through the registry task, so once a new
        // peer is visible the earlier unregisters have been applied.
        let (other, _other_rx) = Connection::new("other", 4);
        hub.register(Arc::clone(&other)).await;
        let live = hub.connections().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id(), other.id());
    }

    #[tokio::test]
    async fn broadcast_skips_stuck_peer() {
        let hub = Hub::new(HubConfig::default());
        let (stuck, _stuck_rx) = Connection::new("stuck", 1);
        let (healthy, mut healthy_rx) = Connection::new("healthy", 8);
        hub.register(Arc::clone(&stuck)).await;
        hub.register(Arc::clone(&healthy)).await;
        stuck.send(&Envelope::Ping).unwrap();

        let report = hub
            .push_command("download_progress", json!({"pct": 50}))
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });

        let msg = healthy_rx.recv().await.unwrap();
        let Envelope::Cmd(cmd) = Envelope::from_json(msg.to_text().unwrap()).unwrap() else {
            panic!("expected cmd");
        };
        assert_eq!(cmd.action, "download_progress");
        assert_eq!(cmd.payload, json!({"pct": 50}));
    }

    #[tokio::test]
    async fn least_active_spreads_in_flight_calls() {
        let hub = Hub::with_selector(HubConfig::default(), Box::new(LeastActiveCalls));
        let (a, mut a_rx) = Connection::new("a", 8);
        let (b, mut b_rx) = Connection::new("b", 8);
        hub.register(Arc::clone(&a)).await;
        hub.register(Arc::clone(&b)).await;

        let first = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.call("one", Value::Null, Duration::from_millis(200)).await })
        };
        let _ = a_rx.recv().await.unwrap();
        assert_eq!(a.active_calls(), 1);

        let second = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.call("two", Value::Null, Duration::from_millis(200)).await })
        };
        let _ = b_rx.recv().await.unwrap();
        assert_eq!(b.active_calls(), 1);

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert_eq!(a.active_calls(), 0);
        assert_eq!(b.active_calls(), 0);
    }
}
