//! Socket endpoint.
//!
//! Clients send JSON `ClientMessage` text frames and receive `ServerFrame`s.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use relay_core::connection::CachedHeaders;
use relay_core::protocol::{ClientMessage, ServerFrame};
use relay_core::{ConnectionHandle, ConnectionMeta};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::AppState;
use crate::session;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// GET /ws
async fn websocket_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let cached = CachedHeaders::capture(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    debug!(remote_addr = ?remote_addr, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| async move {
        let (session_id, principal) = session::resolve(
            state.sessions.as_ref(),
            cookie.as_deref(),
            &state.config.session_cookie,
        )
        .await;
        let meta = ConnectionMeta {
            remote_addr,
            headers: cached,
        };
        handle_socket(socket, state, session_id, principal, meta).await;
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    principal: Option<relay_core::Principal>,
    meta: ConnectionMeta,
) {
    let (handle, outbound) = state.transport.open(state.config.outbound_buffer);
    let closed = handle.closed();
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_frames(sink, outbound, closed.clone()));

    let connection = match state
        .service
        .accept(handle.clone(), principal, session_id, meta)
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "Failed to accept connection");
            handle.close();
            let _ = writer.await;
            return;
        }
    };
    info!(connection_id = %connection.id, "WebSocket connected");

    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_message) => {
                    let service = Arc::clone(&state.service);
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        service.handle_message(&connection, client_message).await;
                    });
                }
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "Ignoring malformed message");
                }
            },
            Some(Ok(Message::Binary(_))) => {
                warn!(connection_id = %connection.id, "Binary frames are not supported");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!(connection_id = %connection.id, "Client closed socket");
                break;
            }
            Some(Err(e)) => {
                warn!(connection_id = %connection.id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    state.service.disconnect(&connection.id).await;
    handle.close();
    if let Err(e) = writer.await {
        error!(error = %e, "WebSocket writer task failed");
    }
    info!(connection_id = %connection.id, "WebSocket disconnected");
}

async fn write_frames<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<ServerFrame>,
    closed: CancellationToken,
) where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to serialize frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(error = %e, "WebSocket send failed");
            closed.cancel();
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
