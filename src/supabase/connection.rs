use super::protocol::PhoenixMessage;
use crate::types::{RealtimeError, Result};
use futures::SinkExt;
use futures::stream::SplitSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Write half of the realtime socket plus the bookkeeping shared with the
/// heartbeat: message refs and the outstanding heartbeat.
pub struct SocketConnection {
    writer: tokio::sync::Mutex<Option<WsSink>>,
    state: Mutex<ConnectionState>,
    ref_counter: AtomicU64,
    pending_heartbeat: Mutex<Option<String>>,
}

impl SocketConnection {
    pub fn new() -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            state: Mutex::new(ConnectionState::Closed),
            ref_counter: AtomicU64::new(0),
            pending_heartbeat: Mutex::new(None),
        }
    }

    /// Install the write half of a freshly opened socket.
    pub async fn attach(&self, writer: WsSink) {
        *self.writer.lock().await = Some(writer);
        self.clear_pending_heartbeat();
        self.set_state(ConnectionState::Open);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            tracing::debug!("Socket {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Generate next message reference
    pub fn make_ref(&self) -> String {
        (self.ref_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub async fn send(&self, message: &PhoenixMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(ws) if self.is_open() => {
                ws.send(Message::Text(json.into())).await?;
                Ok(())
            }
            _ => Err(RealtimeError::NotConnected),
        }
    }

    /// Record a heartbeat awaiting its ack. Returns the previous one if it
    /// was never acknowledged.
    pub fn set_pending_heartbeat(&self, r#ref: String) -> Option<String> {
        self.pending_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(r#ref)
    }

    pub fn pending_heartbeat(&self) -> Option<String> {
        self.pending_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clears the outstanding heartbeat if `r#ref` acknowledges it.
    pub fn ack_heartbeat(&self, r#ref: &str) -> bool {
        let mut pending = self
            .pending_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.as_deref() == Some(r#ref) {
            *pending = None;
            true
        } else {
            false
        }
    }

    fn clear_pending_heartbeat(&self) {
        *self
            .pending_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Closes the socket gracefully. The read loop observes the close.
    pub async fn close(&self) -> Result<()> {
        self.set_state(ConnectionState::Closing);
        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(mut ws) => ws.close().await.map_err(RealtimeError::from),
            None => Ok(()),
        };
        self.clear_pending_heartbeat();
        self.set_state(ConnectionState::Closed);
        result
    }

    /// Forget the writer after the socket died underneath us.
    pub async fn reset(&self) {
        self.writer.lock().await.take();
        self.clear_pending_heartbeat();
        self.set_state(ConnectionState::Closed);
    }
}

impl Default for SocketConnection {
    fn default() -> Self {
        Self::new()
    }
}
