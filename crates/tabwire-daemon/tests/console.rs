use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tabwire_core::{ApiResponse, Envelope};
use tabwire_daemon::console;
use tabwire_hub::{Connection, Hub, HubConfig, server};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn send(app: Router, request: Request<Body>) -> anyhow::Result<(StatusCode, Value)> {
    let response = app.oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// A tab that answers every call through `answer`.
async fn fake_tab(
    hub: &Hub,
    name: &str,
    answer: impl Fn(String, Value) -> Option<Result<Value, (i64, String)>> + Send + 'static,
) {
    let (conn, mut rx) = Connection::new(name, 16);
    assert!(hub.register(conn).await);
    let hub = hub.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = msg.to_text() else { continue };
            let Ok(Envelope::ApiCall(call)) = Envelope::from_json(text) else {
                continue;
            };
            let response = match answer(call.key, call.body) {
                Some(Ok(data)) => ApiResponse::ok(call.id, data),
                Some(Err((code, message))) => ApiResponse::error(call.id, code, message),
                None => continue,
            };
            hub.dispatch_response(response);
        }
    });
}

#[tokio::test]
async fn status_lists_tabs() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    fake_tab(&hub, "main", |_, body| Some(Ok(body))).await;

    let (status, body) = send(console::router(hub, None), get("/api/status")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peers"][0]["name"], "main");
    assert_eq!(body["pending_calls"], 0);
    assert_eq!(body["selector"], "round-robin");
    assert_eq!(body["relay"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn call_returns_tab_data() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    fake_tab(&hub, "main", |key, body| Some(Ok(json!({"key": key, "echo": body})))).await;

    let (status, body) = send(
        console::router(hub, None),
        post("/api/call/user:info", json!({"uid": 4})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"key": "user:info", "echo": {"uid": 4}}));
    Ok(())
}

#[tokio::test]
async fn call_without_tabs_is_unavailable() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    let (status, body) = send(console::router(hub, None), post("/api/call/x", json!({}))).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("no browser tab"));
    Ok(())
}

#[tokio::test]
async fn silent_tab_times_out() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    fake_tab(&hub, "mute", |_, _| None).await;

    let (status, _) = send(
        console::router(hub.clone(), None),
        post("/api/call/slow?timeout_ms=50", json!({})),
    )
    .await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(hub.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn tab_error_is_bad_gateway() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    fake_tab(&hub, "main", |_, _| Some(Err((404, "no such file".to_string())))).await;

    let (status, body) = send(console::router(hub, None), post("/api/call/file:get", json!({}))).await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, json!({"error": "no such file", "code": 404}));
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_every_tab() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    for name in ["a", "b"] {
        let (conn, mut queue) = Connection::new(name, 16);
        assert!(hub.register(conn).await);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                let _ = tx.send(msg.to_text().unwrap_or_default().to_string());
            }
        });
    }

    let (status, body) = send(
        console::router(hub, None),
        post("/api/broadcast", json!({"action": "refresh", "payload": {"page": 1}})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"delivered": 2, "dropped": 0}));

    for _ in 0..2 {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .unwrap();
        let Envelope::Cmd(cmd) = Envelope::from_json(&text)? else {
            panic!("expected a command frame, got {text}");
        };
        assert_eq!(cmd.action, "refresh");
        assert_eq!(cmd.payload, json!({"page": 1}));
    }
    Ok(())
}

#[tokio::test]
async fn tab_on_a_real_socket_is_callable() -> anyhow::Result<()> {
    let hub = Hub::new(HubConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    tokio::spawn(server::run(listener, hub.clone(), shutdown.clone()));

    let (mut ws, _) = connect_async(format!("ws://{addr}/?name=browser")).await?;
    tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(Envelope::ApiCall(call)) = Envelope::from_json(&text) else {
                continue;
            };
            let reply = Envelope::ApiResponse(ApiResponse::ok(call.id, json!({"tab": "browser"})));
            if ws.send(Message::Text(reply.to_json().unwrap().into())).await.is_err() {
                break;
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.connection_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let (status, body) = send(console::router(hub, None), post("/api/call/whoami", json!({}))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"tab": "browser"}));

    shutdown.cancel();
    Ok(())
}
