//! Telemetry stream endpoint: `/ws/stream`
//!
//! The upgrade handler only adapts the socket. Authentication, admission,
//! credential resolution and the polling loop all run inside the session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame as WsCloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

use cloudlens_core::envelope::CloseFrame;
use cloudlens_core::error::TransportError;
use cloudlens_core::session::{Inbound, MAX_CLIENT_FRAME, Transport};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws/stream", get(upgrade))
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let params = state.sessions.params(&query);
    ws.max_message_size(MAX_CLIENT_FRAME)
        .on_upgrade(move |socket| async move {
            let report = state.sessions.run(WsTransport::new(socket), params).await;
            info!(
                session_id = %report.id,
                reason = ?report.reason,
                polls = report.stats.polls,
                envelopes = report.stats.envelopes,
                errors = report.stats.errors,
                duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
                "stream session ended"
            );
        })
}

/// [`Transport`] over an Axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send {
                reason: e.to_string(),
            })
    }

    async fn recv(&mut self) -> Inbound {
        match self.socket.recv().await {
            Some(Ok(Message::Text(text))) => Inbound::Text(text.as_str().to_owned()),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => Inbound::Keepalive,
            Some(Ok(Message::Close(_))) | None => Inbound::Closed,
            Some(Err(e)) => {
                debug!(error = %e, "websocket receive failed");
                Inbound::Closed
            }
        }
    }

    async fn close(&mut self, frame: CloseFrame) -> Result<(), TransportError> {
        self.socket
            .send(Message::Close(Some(WsCloseFrame {
                code: frame.code,
                reason: frame.reason.into(),
            })))
            .await
            .map_err(|e| TransportError::Send {
                reason: e.to_string(),
            })
    }
}
