use super::connection::SocketConnection;
use super::heartbeat::SocketHeartbeat;
use super::options::SupabaseOptions;
use super::protocol::{JoinPayload, PhoenixMessage, SystemPayload};
use super::rest::RestClient;
use crate::channel::{PostgresChangesMessage, TableFilter};
use crate::infrastructure::TaskManager;
use crate::remote::{RemoteService, TransportEvent};
use crate::types::{REALTIME_TOPIC_PREFIX, Result, channel_events, phoenix_events};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::SplitStream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const CHANNEL_BUFFER: usize = 256;

/// Where frames for one joined topic go.
struct ChannelRoute {
    join_ref: String,
    events: mpsc::Sender<TransportEvent>,
}

struct SocketShared {
    options: SupabaseOptions,
    connection: Arc<SocketConnection>,
    /// Keyed by full topic (`realtime:<name>`)
    routes: RwLock<HashMap<String, ChannelRoute>>,
    connect_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<TaskManager>,
}

/// [`RemoteService`] backed by a Supabase project: realtime channels over
/// one lazily opened Phoenix socket, writes and RPC over PostgREST.
pub struct SupabaseService {
    rest: RestClient,
    socket: Arc<SocketShared>,
}

impl SupabaseService {
    pub fn new(options: SupabaseOptions) -> Result<Self> {
        // Fail early on a bad URL or missing key
        options.realtime_url()?;
        let rest = RestClient::new(&options)?;
        Ok(Self {
            rest,
            socket: Arc::new(SocketShared {
                options,
                connection: Arc::new(SocketConnection::new()),
                routes: RwLock::new(HashMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(TaskManager::new()),
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.socket.connection.is_open()
    }

    /// Close the socket. Open channels observe `Errored` and the next
    /// `open_channel` reconnects.
    pub async fn disconnect(&self) -> Result<()> {
        self.socket.connection.close().await
    }
}

impl Drop for SupabaseService {
    fn drop(&mut self) {
        self.socket
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

impl SocketShared {
    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let _connecting = self.connect_lock.lock().await;
        if self.connection.is_open() {
            return Ok(());
        }

        let url = self.options.realtime_url()?;
        tracing::info!("Connecting to {}", url.host_str().unwrap_or_default());
        self.connection
            .set_state(super::connection::ConnectionState::Connecting);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                self.connection.reset().await;
                return Err(e.into());
            }
        };
        let (write_half, read_half) = ws_stream.split();
        self.connection.attach(write_half).await;

        let read_task = Self::read_loop(Arc::downgrade(self), read_half);
        let heartbeat = SocketHeartbeat::new(Arc::downgrade(&self.connection))
            .with_interval(self.options.heartbeat_interval())
            .spawn();
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.spawn(read_task);
            tasks.track(heartbeat);
        }

        tracing::info!("Connected to realtime server");
        Ok(())
    }

    async fn read_loop(shared: Weak<Self>, mut read_half: WsStream) {
        tracing::info!("Starting read task");
        while let Some(frame) = read_half.next().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<PhoenixMessage>(&text) {
                    Ok(message) => shared.dispatch(message).await,
                    Err(e) => tracing::error!("Failed to parse message: {} - Raw: {}", e, text),
                },
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(close_frame) => tracing::warn!(
                            "Server closed connection: code={:?}, reason='{}'",
                            close_frame.code,
                            close_frame.reason
                        ),
                        None => tracing::warn!("Server closed connection without close frame"),
                    }
                    break;
                }
                Ok(Message::Binary(data)) => {
                    tracing::warn!("Received unexpected binary message ({} bytes)", data.len());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }

        if let Some(shared) = shared.upgrade() {
            shared.connection.reset().await;
            shared.fail_all_routes("socket closed").await;
        }
        tracing::info!("Read task finished");
    }

    async fn dispatch(&self, message: PhoenixMessage) {
        if message.is_heartbeat_reply() {
            if let Some(r#ref) = &message.r#ref
                && self.connection.ack_heartbeat(r#ref)
            {
                tracing::debug!("Received heartbeat ack for ref {}", r#ref);
            }
            return;
        }

        let (join_ref, events) = {
            let routes = self.routes.read().await;
            match routes.get(&message.topic) {
                Some(route) => (route.join_ref.clone(), route.events.clone()),
                None => {
                    tracing::debug!("Dropping {} for unknown topic {}", message.event, message.topic);
                    return;
                }
            }
        };

        // Frames from a previous join of the same topic are stale
        if let Some(frame_join_ref) = &message.join_ref
            && *frame_join_ref != join_ref
        {
            return;
        }

        let Some(event) = Self::to_transport_event(&message, &join_ref) else {
            return;
        };
        let closing = matches!(event, TransportEvent::Closed);
        if events.send(event).await.is_err() || closing {
            self.routes.write().await.remove(&message.topic);
        }
    }

    fn to_transport_event(message: &PhoenixMessage, join_ref: &str) -> Option<TransportEvent> {
        match message.event.as_str() {
            phoenix_events::REPLY => {
                if message.r#ref.as_deref() != Some(join_ref) {
                    return None;
                }
                let reply = message.reply()?;
                if reply.is_ok() {
                    Some(TransportEvent::Subscribed)
                } else {
                    Some(TransportEvent::Errored(reply.reason()))
                }
            }
            phoenix_events::ERROR => Some(TransportEvent::Errored("channel error".to_string())),
            phoenix_events::CLOSE => Some(TransportEvent::Closed),
            channel_events::POSTGRES_CHANGES => {
                match serde_json::from_value::<PostgresChangesMessage>(message.payload.clone()) {
                    Ok(change) => Some(TransportEvent::Change(change.data)),
                    Err(e) => {
                        tracing::error!("Malformed postgres_changes payload: {}", e);
                        None
                    }
                }
            }
            channel_events::SYSTEM => {
                let system: SystemPayload = serde_json::from_value(message.payload.clone()).ok()?;
                if system.status == "error" {
                    Some(TransportEvent::Errored(system.message))
                } else {
                    tracing::debug!(topic = %message.topic, "System: {}", system.message);
                    None
                }
            }
            other => {
                tracing::debug!(topic = %message.topic, "Ignoring {} frame", other);
                None
            }
        }
    }

    async fn fail_all_routes(&self, reason: &str) {
        let routes: Vec<ChannelRoute> = self.routes.write().await.drain().map(|(_, r)| r).collect();
        for route in routes {
            let _ = route
                .events
                .send(TransportEvent::Errored(reason.to_string()))
                .await;
        }
    }
}

#[async_trait]
impl RemoteService for SupabaseService {
    async fn open_channel(
        &self,
        name: &str,
        filters: &[TableFilter],
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        self.socket.ensure_connected().await?;

        let topic = format!("{}{}", REALTIME_TOPIC_PREFIX, name);
        let join_ref = self.socket.connection.make_ref();
        let payload =
            JoinPayload::postgres_changes(filters, self.socket.options.access_token.clone());
        let frame = PhoenixMessage::join(topic.clone(), &payload, join_ref.clone())?;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.socket.routes.write().await.insert(
            topic.clone(),
            ChannelRoute {
                join_ref,
                events: tx,
            },
        );
        if let Err(e) = self.socket.connection.send(&frame).await {
            self.socket.routes.write().await.remove(&topic);
            return Err(e);
        }
        tracing::debug!("Joining {}", topic);
        Ok(rx)
    }

    async fn close_channel(&self, name: &str) -> Result<()> {
        let topic = format!("{}{}", REALTIME_TOPIC_PREFIX, name);
        let removed = self.socket.routes.write().await.remove(&topic);
        if removed.is_some() && self.socket.connection.is_open() {
            let r#ref = self.socket.connection.make_ref();
            self.socket
                .connection
                .send(&PhoenixMessage::leave(topic, r#ref))
                .await?;
        }
        Ok(())
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        self.rest.insert(table, row).await
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()> {
        self.rest.upsert(table, row, on_conflict).await
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        self.rest.rpc(function, params).await
    }

    fn beacon(&self, table: &str, row: Value, on_conflict: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, dropping beacon to {}", table);
            return;
        };
        let rest = self.rest.clone();
        let table = table.to_string();
        let on_conflict = on_conflict.to_string();
        runtime.spawn(async move {
            if let Err(e) = rest.upsert(&table, row, &on_conflict).await {
                tracing::warn!("Beacon to {} failed: {}", table, e);
            }
        });
    }
}
