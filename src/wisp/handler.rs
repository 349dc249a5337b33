//! Axum WebSocket handler for Wisp protocol

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, trace, warn};

use super::config::WispConfig;
use super::dialer::{Dialer, NetDialer};
use super::session::WispSession;

/// Application state for the Wisp handler
#[derive(Clone)]
pub struct WispState {
    pub config: Arc<WispConfig>,
    pub dialer: Arc<dyn Dialer>,
}

impl WispState {
    pub fn new(config: WispConfig) -> Self {
        let config = Arc::new(config);
        let dialer = Arc::new(NetDialer::new(config.clone()));
        Self { config, dialer }
    }
}

impl Default for WispState {
    fn default() -> Self {
        Self::new(WispConfig::default())
    }
}

/// Axum handler for Wisp WebSocket connections. Every origin is accepted;
/// the hostname policy is the only gate.
pub async fn wisp_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WispState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_wisp_connection(socket, state))
}

/// Handle a single Wisp WebSocket connection
async fn handle_wisp_connection(socket: WebSocket, state: WispState) {
    if state.config.websocket_permessage_deflate {
        // The upgrade above negotiates no extensions, so the flag cannot
        // take effect on this transport
        warn!("websocket_permessage_deflate is set but unsupported, continuing uncompressed");
    }

    let (mut ws_write, mut ws_read) = socket.split();
    let (session, mut packet_rx) = WispSession::new(state.config.clone(), state.dialer.clone());

    debug!("[{}] Wisp client connected", session.id());

    // Sole WebSocket writer: drains the session's serialized packet channel.
    // A write failure ends the task; the dead socket then surfaces in the
    // read loop, which tears the session down.
    let writer = tokio::spawn(async move {
        while let Some(frame) = packet_rx.recv().await {
            if let Err(e) = ws_write.send(Message::Binary(frame)).await {
                trace!("WebSocket send error: {}", e);
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    while let Some(message) = ws_read.next().await {
        match message {
            Ok(Message::Binary(frame)) => session.handle_frame(frame),
            Ok(Message::Close(_)) => break,
            // Pings are answered by the WebSocket layer; text is not Wisp
            Ok(_) => {}
            Err(e) => {
                trace!("[{}] WebSocket receive error: {}", session.id(), e);
                break;
            }
        }
    }

    session.teardown();
    debug!("[{}] Wisp client disconnected", session.id());

    // Streams drop their channel senders as they wind down, which closes
    // the packet channel and lets the writer task finish.
    drop(session);
    let _ = writer.await;
}
