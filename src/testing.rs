//! In-memory backend used by unit tests.

use crate::channel::{PostgresChangesPayload, TableFilter};
use crate::remote::{Notifier, RemoteService, TransportEvent};
use crate::types::{RealtimeError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Let every ready task run. Under paused time this also guarantees no
/// timer fires early, since the clock only auto-advances once all tasks idle.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Default)]
struct MockState {
    opens: Vec<(String, Instant)>,
    closes: Vec<String>,
    senders: HashMap<String, mpsc::Sender<TransportEvent>>,
    fail_opens: bool,
    inserts: Vec<(String, Value)>,
    failing_inserts: usize,
    insert_offline: bool,
    insert_delay: Option<Duration>,
    open_delay: Option<Duration>,
    close_delay: Option<Duration>,
    server_ids: VecDeque<String>,
    next_server_id: u64,
    upserts: Vec<(String, Value, String)>,
    rpcs: Vec<(String, Value)>,
    beacons: Vec<(String, Value)>,
}

pub(crate) struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.lock().fail_opens = fail;
    }

    /// The next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.lock().failing_inserts = count;
    }

    /// Every insert fails until switched back.
    pub fn set_insert_offline(&self, offline: bool) {
        self.lock().insert_offline = offline;
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        self.lock().insert_delay = Some(delay);
    }

    /// `open_channel` takes this long before the join is answered.
    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = Some(delay);
    }

    /// `close_channel` takes this long before the server drops the channel.
    pub fn set_close_delay(&self, delay: Duration) {
        self.lock().close_delay = Some(delay);
    }

    pub fn push_server_id(&self, id: &str) {
        self.lock().server_ids.push_back(id.to_string());
    }

    pub fn opens(&self) -> Vec<String> {
        self.lock().opens.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.lock().opens.iter().map(|(_, t)| *t).collect()
    }

    pub fn closes(&self) -> Vec<String> {
        self.lock().closes.clone()
    }

    pub fn inserts(&self) -> Vec<(String, Value)> {
        self.lock().inserts.clone()
    }

    pub fn upserts(&self) -> Vec<(String, Value, String)> {
        self.lock().upserts.clone()
    }

    pub fn rpcs(&self) -> Vec<(String, Value)> {
        self.lock().rpcs.clone()
    }

    pub fn beacons(&self) -> Vec<(String, Value)> {
        self.lock().beacons.clone()
    }

    /// Deliver a change on every open channel.
    pub async fn emit_change(&self, payload: PostgresChangesPayload) {
        for sender in self.senders() {
            let _ = sender.send(TransportEvent::Change(payload.clone())).await;
        }
    }

    pub async fn fail_all_channels(&self, reason: &str) {
        for sender in self.senders() {
            let _ = sender
                .send(TransportEvent::Errored(reason.to_string()))
                .await;
        }
    }

    fn senders(&self) -> Vec<mpsc::Sender<TransportEvent>> {
        self.lock().senders.values().cloned().collect()
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn open_channel(
        &self,
        name: &str,
        _filters: &[TableFilter],
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let delay = self.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.opens.push((name.to_string(), Instant::now()));
        if state.fail_opens {
            return Err(RealtimeError::Connection("network unreachable".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(TransportEvent::Subscribed);
        state.senders.insert(name.to_string(), tx);
        Ok(rx)
    }

    async fn close_channel(&self, name: &str) -> Result<()> {
        let delay = self.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.closes.push(name.to_string());
        state.senders.remove(name);
        Ok(())
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<Value> {
        let delay = self.lock().insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.inserts.push((table.to_string(), row.clone()));
        if state.insert_offline {
            return Err(RealtimeError::Delivery("network unreachable".to_string()));
        }
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(RealtimeError::Delivery("503 service unavailable".to_string()));
        }
        let id = match state.server_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_server_id += 1;
                format!("srv_{}", state.next_server_id)
            }
        };
        if let Some(object) = row.as_object_mut() {
            object.insert("id".to_string(), Value::String(id));
            object.insert("status".to_string(), Value::String("sent".to_string()));
        }
        Ok(row)
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()> {
        self.lock()
            .upserts
            .push((table.to_string(), row, on_conflict.to_string()));
        Ok(())
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        self.lock().rpcs.push((function.to_string(), params));
        Ok(Value::Null)
    }

    fn beacon(&self, table: &str, row: Value, _on_conflict: &str) {
        self.lock().beacons.push((table.to_string(), row));
    }
}

/// Notifier that records what it was asked to show.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub shown: Mutex<Vec<(String, String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str, target_user_id: &str) {
        self.shown.lock().unwrap().push((
            title.to_string(),
            body.to_string(),
            target_user_id.to_string(),
        ));
    }
}
