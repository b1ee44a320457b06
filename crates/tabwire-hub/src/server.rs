//! Peer-facing WebSocket endpoint.

use crate::Hub;
use crate::connection::{self, Connection};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Accept peers on `listener` until `shutdown` fires.
pub async fn run(listener: TcpListener, hub: Hub, shutdown: CancellationToken) -> std::io::Result<()> {
    tracing::info!("Listening for peers on ws://{}", listener.local_addr()?);

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let hub = hub.clone();

        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(stream, addr, hub).await {
                    tracing::warn!("Connection error: {}", e);
                }
            }
            .instrument(tracing::info_span!("peer", %addr)),
        );
    }

    tracing::info!("Peer listener stopped");
    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Hub) -> Result<(), tungstenite::Error> {
    let config = hub.config().connection.clone();
    let ws_config = WebSocketConfig::default().max_message_size(Some(config.max_message_size));

    let mut name = None;
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            name = peer_name(req.uri());
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;

    let name = name.unwrap_or_else(|| addr.to_string());
    let (conn, outbound_rx) = Connection::new(name, config.queue_capacity);
    if !hub.register(conn.clone()).await {
        return Ok(());
    }

    tracing::debug!("New peer {} from {}", conn.id(), addr);
    connection::serve(conn, outbound_rx, ws, hub, config).await;
    Ok(())
}

/// The `name` query parameter of the upgrade request, if any, form-decoded.
fn peer_name(uri: &Uri) -> Option<String> {
    let (_, raw) = uri
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "name")?;
    let name = urlencoding::decode(&raw.replace('+', " ")).ok()?.into_owned();
    (!name.is_empty()).then_some(name)
}
