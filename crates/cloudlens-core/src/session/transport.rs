//! The bidirectional channel a session runs over.
//!
//! The host (a WebSocket upgrade, a test harness) owns the framing. A
//! session only needs to push text frames, pull inbound frames, and close.

use async_trait::async_trait;
use tracing::trace;

use crate::envelope::{CloseFrame, Envelope};
use crate::error::TransportError;

/// One inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// Ping, pong, binary, or anything else that only proves liveness.
    Keepalive,
    /// The peer closed or the connection dropped.
    Closed,
}

/// A bidirectional message channel to one client.
///
/// `recv` must be cancellation safe: the session races it against polls
/// and timers and drops the future of whichever branch loses.
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next inbound event.
    async fn recv(&mut self) -> Inbound;

    /// Send a close frame. The transport is unusable afterwards.
    async fn close(&mut self, frame: CloseFrame) -> Result<(), TransportError>;
}

/// Session-side wrapper that makes every operation after close a no-op.
pub(crate) struct Outbox<T> {
    transport: T,
    closed: bool,
}

impl<T: Transport> Outbox<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self {
            transport,
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed {
            trace!(kind = %envelope.kind, "dropping envelope for closed session");
            return Ok(());
        }
        let text = envelope.to_json().map_err(|e| TransportError::Send {
            reason: format!("envelope serialization failed: {e}"),
        })?;
        let result = self.transport.send_text(text).await;
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    pub(crate) async fn recv(&mut self) -> Inbound {
        if self.closed {
            return Inbound::Closed;
        }
        let inbound = self.transport.recv().await;
        if inbound == Inbound::Closed {
            self.closed = true;
        }
        inbound
    }

    /// Send a close frame once. Later calls do nothing.
    pub(crate) async fn close(&mut self, frame: CloseFrame) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.close(frame).await
    }

    /// Mark the peer as gone without sending anything.
    pub(crate) fn abandon(&mut self) {
        self.closed = true;
    }
}
