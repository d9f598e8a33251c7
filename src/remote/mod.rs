//! Seams to the hosted backend: realtime channels, table writes, RPC and
//! user-visible notifications.

use crate::channel::{PostgresChangesPayload, TableFilter};
use crate::types::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// What a realtime channel reports back after `open_channel`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server acknowledged the join
    Subscribed,
    /// A row change matching one of the channel's filters
    Change(PostgresChangesPayload),
    /// The server or the socket reported an error on this channel
    Errored(String),
    /// The channel was closed by the server
    Closed,
}

/// Backend operations the coordinator depends on.
///
/// The channel multiplexer is the only caller of `open_channel` and
/// `close_channel`. Dropping the returned receiver's sender side (the
/// stream ending) is treated like `Closed`.
#[async_trait]
pub trait RemoteService: Send + Sync + 'static {
    async fn open_channel(
        &self,
        name: &str,
        filters: &[TableFilter],
    ) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn close_channel(&self, name: &str) -> Result<()>;

    /// Insert a row and return the stored representation.
    async fn insert(&self, table: &str, row: Value) -> Result<Value>;

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()>;

    async fn rpc(&self, function: &str, params: Value) -> Result<Value>;

    /// Best-effort fire-and-forget write used during teardown. Must not block.
    fn beacon(&self, table: &str, row: Value, on_conflict: &str);
}

/// Surfaces user-visible notifications (e.g. a new message while the
/// conversation is not on screen).
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, title: &str, body: &str, target_user_id: &str);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str, target_user_id: &str) {
        tracing::info!(target_user_id, "Notification: {} - {}", title, body);
    }
}
