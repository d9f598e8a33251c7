use super::connection::SocketConnection;
use super::protocol::PhoenixMessage;
use crate::types::HEARTBEAT_INTERVAL;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Keeps the realtime socket alive and detects a dead one.
///
/// A heartbeat still unacknowledged when the next tick comes around means
/// the socket is gone; it is closed so the read loop can report it.
pub struct SocketHeartbeat {
    interval: Duration,
    connection: Weak<SocketConnection>,
}

impl SocketHeartbeat {
    pub fn new(connection: Weak<SocketConnection>) -> Self {
        Self {
            interval: Duration::from_millis(HEARTBEAT_INTERVAL),
            connection,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawns the heartbeat task. It ends with the socket.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = time::interval(self.interval);
            interval_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval_timer.tick().await;

            loop {
                interval_timer.tick().await;

                let Some(connection) = self.connection.upgrade() else {
                    break;
                };
                if !connection.is_open() {
                    break;
                }

                if let Some(missed) = connection.pending_heartbeat() {
                    tracing::warn!("Heartbeat {} timed out, closing socket", missed);
                    if let Err(e) = connection.close().await {
                        tracing::debug!("Error closing timed out socket: {}", e);
                    }
                    break;
                }

                let r#ref = connection.make_ref();
                connection.set_pending_heartbeat(r#ref.clone());
                match connection.send(&PhoenixMessage::heartbeat(r#ref.clone())).await {
                    Ok(()) => tracing::debug!("Sent heartbeat with ref {}", r#ref),
                    Err(e) => tracing::error!("Failed to send heartbeat: {}", e),
                }
            }
            tracing::debug!("Socket heartbeat task finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_when_socket_is_closed() {
        let connection = Arc::new(SocketConnection::new());
        let handle = SocketHeartbeat::new(Arc::downgrade(&connection))
            .with_interval(Duration::from_secs(25))
            .spawn();

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert!(handle.is_finished());
        assert_eq!(connection.pending_heartbeat(), None);
    }
}
