use super::snapshot::{ConversationCache, ConversationSnapshot};
use super::storage::LocalStore;
use crate::infrastructure::Clock;
use crate::messaging::{ChangeEvent, ChangeKind};
use crate::remote::RemoteService;
use crate::types::{
    ChatMessage, DeliveryState, MAX_DELIVERY_ATTEMPTS, MAX_MESSAGES_PER_CONVERSATION, MessageId,
    OUTBOX_MAX_RETRY_DELAY, OUTBOX_RETRY_DELAY, PendingMessage, RealtimeError, Result,
    STORAGE_BUDGET_BYTES, SendPayload, StorageError, storage_keys, tables,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Tuning for the outbox.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    /// Insert attempts before an entry is marked `Failed`
    pub max_delivery_attempts: u32,
    /// First delay before re-flushing after an interrupted pass
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_messages_per_conversation: usize,
    /// Bound on the serialized outbox plus every cached conversation
    pub storage_budget_bytes: usize,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            max_delivery_attempts: MAX_DELIVERY_ATTEMPTS,
            retry_base_delay: Duration::from_millis(OUTBOX_RETRY_DELAY),
            retry_max_delay: Duration::from_millis(OUTBOX_MAX_RETRY_DELAY),
            max_messages_per_conversation: MAX_MESSAGES_PER_CONVERSATION,
            storage_budget_bytes: STORAGE_BUDGET_BYTES,
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another pass was already running; nothing was sent
    AlreadyRunning,
    /// Every deliverable entry was sent
    Completed { delivered: usize },
    /// An insert failed; the pass stopped at that entry
    Interrupted { delivered: usize, error: String },
}

/// What an inbound `messages` change did to the local cache.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteApply {
    /// A message not seen before
    New(ChatMessage),
    /// The server echo of a local optimistic send
    Reconciled { temp_id: MessageId, message: ChatMessage },
    Updated(ChatMessage),
    Removed(MessageId),
    /// Not relevant to this user, or already known
    Ignored,
}

struct OutboxState {
    pending: Vec<PendingMessage>,
    cache: ConversationCache,
    in_flight: Option<MessageId>,
    /// Serialized size of each conversation as last written
    sizes: HashMap<String, usize>,
}

/// Releases the flush flag when the pass ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable queue of outgoing messages plus the local conversation cache.
///
/// Sends are accepted synchronously and shown immediately under a temporary
/// id. A flush delivers them in order; each acknowledgement replaces the
/// temporary message in place with the server's row.
pub struct Outbox {
    self_id: String,
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    options: OutboxOptions,
    state: Mutex<OutboxState>,
    flushing: AtomicBool,
    seq: AtomicU64,
}

impl Outbox {
    pub fn new(
        self_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        options: OutboxOptions,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            store,
            clock,
            options,
            state: Mutex::new(OutboxState {
                pending: Vec::new(),
                cache: ConversationCache::default(),
                in_flight: None,
                sizes: HashMap::new(),
            }),
            flushing: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &OutboxOptions {
        &self.options
    }

    /// Queue a message and show it optimistically.
    ///
    /// Nothing is kept if it cannot be persisted.
    pub fn enqueue_send(&self, payload: SendPayload) -> Result<PendingMessage> {
        payload.validate()?;
        let now = self.clock.now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = PendingMessage {
            id: MessageId::temporary(now, seq),
            sender_id: self.self_id.clone(),
            payload,
            created_at: now,
            state: DeliveryState::Sending,
            attempts: 0,
            last_error: None,
        };
        let counterparty = entry.payload.recipient_id.clone();

        let mut state = self.lock();
        let existed = state.cache.get(&counterparty).is_some();
        state.pending.push(entry.clone());
        state
            .cache
            .entry(&counterparty, now)
            .append(entry.to_chat_message(), now);

        if let Err(e) = self.persist(&mut state, &[counterparty.as_str()]) {
            state.pending.retain(|p| p.id != entry.id);
            // The conversation may already be on disk with the optimistic message
            let touched = [counterparty.as_str()];
            let rewrite: &[&str] = if existed {
                if let Some(conversation) = state.cache.get_mut(&counterparty) {
                    conversation.remove(&entry.id);
                }
                &touched
            } else {
                state.cache.remove(&counterparty);
                state.sizes.remove(&counterparty);
                if let Err(remove) = self.store.remove(&conversation_key(&counterparty)) {
                    tracing::warn!("Could not remove conversation with {}: {}", counterparty, remove);
                }
                &[]
            };
            if let Err(undo) = self.persist(&mut state, rewrite) {
                tracing::warn!("Could not restore storage after dropped send: {}", undo);
            }
            tracing::warn!("Dropping send to {}: {}", counterparty, e);
            return Err(e);
        }

        tracing::debug!(id = %entry.id, "Queued message for {}", counterparty);
        Ok(entry)
    }

    /// Deliver queued messages in order, one at a time.
    ///
    /// Stops at the first failure. `Failed` entries are skipped. Returns
    /// `AlreadyRunning` without sending anything if a pass is in progress.
    pub async fn flush(&self, remote: &dyn RemoteService) -> FlushOutcome {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            return FlushOutcome::AlreadyRunning;
        };

        let mut delivered = 0;
        loop {
            let Some(entry) = self.begin_attempt() else {
                break;
            };
            let row = entry.payload.to_row(&self.self_id, entry.created_at);
            tracing::debug!(id = %entry.id, attempt = entry.attempts, "Delivering queued message");

            match remote.insert(tables::MESSAGES, row).await {
                Ok(value) => {
                    self.complete(&entry, value);
                    delivered += 1;
                }
                Err(e) => {
                    let error = e.to_string();
                    self.fail_attempt(&entry.id, &error);
                    return FlushOutcome::Interrupted { delivered, error };
                }
            }
        }

        if delivered > 0 {
            tracing::info!("Flushed {} queued message(s)", delivered);
        }
        FlushOutcome::Completed { delivered }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    fn begin_attempt(&self) -> Option<PendingMessage> {
        let mut state = self.lock();
        let entry = state
            .pending
            .iter_mut()
            .find(|p| p.state != DeliveryState::Failed)?;
        entry.attempts += 1;
        let entry = entry.clone();
        state.in_flight = Some(entry.id.clone());
        if let Err(e) = self.persist(&mut state, &[]) {
            tracing::warn!("Could not persist attempt count: {}", e);
        }
        Some(entry)
    }

    fn complete(&self, entry: &PendingMessage, response: serde_json::Value) {
        let mut state = self.lock();
        state.in_flight = None;
        let counterparty = entry.payload.recipient_id.clone();

        match ChatMessage::from_row(response) {
            Ok(message) => {
                tracing::debug!(temp = %entry.id, id = %message.id, "Message acknowledged");
                self.settle_delivery(&mut state, &entry.id, message);
            }
            Err(e) => {
                // The row is stored server-side; keep the optimistic copy as sent
                tracing::warn!(id = %entry.id, "Unreadable insert response: {}", e);
                state.pending.retain(|p| p.id != entry.id);
                let now = self.clock.now();
                if let Some(conversation) = state.cache.get_mut(&counterparty)
                    && let Some(index) = conversation.position(&entry.id)
                {
                    conversation.messages[index].status = DeliveryState::Sent;
                    conversation.last_activity = conversation.last_activity.max(now);
                }
            }
        }

        if let Err(e) = self.persist(&mut state, &[counterparty.as_str()]) {
            tracing::warn!("Could not persist delivery of {}: {}", entry.id, e);
        }
    }

    fn fail_attempt(&self, id: &MessageId, error: &str) {
        let mut state = self.lock();
        state.in_flight = None;
        let max = self.options.max_delivery_attempts;
        let Some(entry) = state.pending.iter_mut().find(|p| &p.id == id) else {
            // Reconciled by an echo while the insert was in flight
            return;
        };
        entry.last_error = Some(error.to_string());
        let counterparty = entry.payload.recipient_id.clone();
        if entry.attempts >= max {
            entry.state = DeliveryState::Failed;
            tracing::warn!(id = %id, "Giving up after {} attempts: {}", entry.attempts, error);
            if let Some(conversation) = state.cache.get_mut(&counterparty)
                && let Some(index) = conversation.position(id)
            {
                conversation.messages[index].status = DeliveryState::Failed;
            }
        } else {
            tracing::info!(id = %id, "Delivery attempt {} failed: {}", entry.attempts, error);
        }
        if let Err(e) = self.persist(&mut state, &[counterparty.as_str()]) {
            tracing::warn!("Could not persist failed attempt: {}", e);
        }
    }

    /// Replace the optimistic message by the server row and drop the outbox entry.
    fn settle_delivery(&self, state: &mut OutboxState, temp_id: &MessageId, message: ChatMessage) {
        state.pending.retain(|p| &p.id != temp_id);
        let now = self.clock.now();
        let conversation = state
            .cache
            .entry(message.counterparty(&self.self_id), now);
        if conversation.contains(&message.id) {
            conversation.remove(temp_id);
        } else if !conversation.replace(temp_id, message.clone(), now) {
            conversation.insert_sorted(message, now);
        }
        conversation.cap(self.options.max_messages_per_conversation);
    }

    /// Which optimistic message a server row sent by us is the echo of.
    ///
    /// Only entries that may have reached the server qualify: the one in
    /// flight, ones attempted before, or ones already acknowledged.
    fn echo_target(&self, state: &OutboxState, message: &ChatMessage) -> Option<MessageId> {
        let in_flight = state.in_flight.as_ref();
        let from_pending = state
            .pending
            .iter()
            .filter(|p| p.is_echoed_by(message))
            .filter(|p| Some(&p.id) == in_flight || p.attempts > 0)
            .min_by_key(|p| (Some(&p.id) != in_flight, p.created_at))
            .map(|p| p.id.clone());
        if from_pending.is_some() {
            return from_pending;
        }

        let pending: HashSet<&MessageId> = state.pending.iter().map(|p| &p.id).collect();
        state
            .cache
            .get(message.counterparty(&self.self_id))?
            .messages
            .iter()
            .find(|m| {
                m.id.is_temporary()
                    && m.status == DeliveryState::Sent
                    && !pending.contains(&m.id)
                    && m.sender_id == message.sender_id
                    && m.recipient_id == message.recipient_id
                    && m.content == message.content
                    && m.attachment == message.attachment
            })
            .map(|m| m.id.clone())
    }

    /// Apply an inbound change on the `messages` table.
    pub fn apply_remote(&self, event: &ChangeEvent) -> RemoteApply {
        if event.table != tables::MESSAGES {
            return RemoteApply::Ignored;
        }
        if event.kind == ChangeKind::Delete {
            return self.remove_remote(event);
        }
        let Some(row) = event.new_value.clone() else {
            return RemoteApply::Ignored;
        };
        let message = match ChatMessage::from_row(serde_json::Value::Object(row)) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed message row: {}", e);
                return RemoteApply::Ignored;
            }
        };
        if message.sender_id != self.self_id && message.recipient_id != self.self_id {
            return RemoteApply::Ignored;
        }

        let counterparty = message.counterparty(&self.self_id).to_string();
        let now = self.clock.now();
        let mut state = self.lock();

        let outcome = match event.kind {
            ChangeKind::Insert => {
                let known = state
                    .cache
                    .get(&counterparty)
                    .is_some_and(|c| c.contains(&message.id));
                if known {
                    RemoteApply::Ignored
                } else if message.sender_id == self.self_id
                    && let Some(temp_id) = self.echo_target(&state, &message)
                {
                    tracing::debug!(temp = %temp_id, id = %message.id, "Reconciled optimistic message from echo");
                    self.settle_delivery(&mut state, &temp_id, message.clone());
                    RemoteApply::Reconciled { temp_id, message }
                } else {
                    state
                        .cache
                        .entry(&counterparty, now)
                        .insert_sorted(message.clone(), now);
                    RemoteApply::New(message)
                }
            }
            _ => {
                let conversation = state.cache.entry(&counterparty, now);
                if !conversation.replace(&message.id, message.clone(), now) {
                    conversation.insert_sorted(message.clone(), now);
                }
                RemoteApply::Updated(message)
            }
        };

        if !matches!(outcome, RemoteApply::Ignored) {
            let max = self.options.max_messages_per_conversation;
            if let Some(conversation) = state.cache.get_mut(&counterparty) {
                conversation.cap(max);
            }
            if let Err(e) = self.persist(&mut state, &[counterparty.as_str()]) {
                tracing::warn!("Could not persist conversation with {}: {}", counterparty, e);
            }
        }
        outcome
    }

    fn remove_remote(&self, event: &ChangeEvent) -> RemoteApply {
        let Some(id) = event.identity("id").map(MessageId::server) else {
            return RemoteApply::Ignored;
        };
        let mut state = self.lock();
        let Some(counterparty) = state.cache.find(&id).map(str::to_string) else {
            return RemoteApply::Ignored;
        };
        if let Some(conversation) = state.cache.get_mut(&counterparty) {
            conversation.remove(&id);
        }
        if let Err(e) = self.persist(&mut state, &[counterparty.as_str()]) {
            tracing::warn!("Could not persist conversation with {}: {}", counterparty, e);
        }
        RemoteApply::Removed(id)
    }

    /// Put a `Failed` entry back in the queue with a fresh attempt budget.
    pub fn retry_failed(&self, id: &MessageId) -> Result<bool> {
        let mut state = self.lock();
        let Some(entry) = state
            .pending
            .iter_mut()
            .find(|p| &p.id == id && p.state == DeliveryState::Failed)
        else {
            return Ok(false);
        };
        entry.state = DeliveryState::Sending;
        entry.attempts = 0;
        entry.last_error = None;
        let counterparty = entry.payload.recipient_id.clone();
        if let Some(conversation) = state.cache.get_mut(&counterparty)
            && let Some(index) = conversation.position(id)
        {
            conversation.messages[index].status = DeliveryState::Sending;
        }
        self.persist(&mut state, &[counterparty.as_str()])?;
        Ok(true)
    }

    /// Drop a `Failed` entry and its optimistic message.
    pub fn discard_failed(&self, id: &MessageId) -> Result<bool> {
        let mut state = self.lock();
        let Some(index) = state
            .pending
            .iter()
            .position(|p| &p.id == id && p.state == DeliveryState::Failed)
        else {
            return Ok(false);
        };
        let entry = state.pending.remove(index);
        let counterparty = entry.payload.recipient_id;
        if let Some(conversation) = state.cache.get_mut(&counterparty) {
            conversation.remove(id);
        }
        self.persist(&mut state, &[counterparty.as_str()])?;
        Ok(true)
    }

    /// Mark everything `counterparty` sent us as read. Returns how many changed.
    pub fn mark_read_local(&self, counterparty: &str) -> usize {
        let mut state = self.lock();
        let Some(conversation) = state.cache.get_mut(counterparty) else {
            return 0;
        };
        let mut changed = 0;
        for message in conversation
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == counterparty && m.recipient_id == self.self_id)
        {
            if message.status != DeliveryState::Read {
                message.status = DeliveryState::Read;
                changed += 1;
            }
        }
        if changed > 0
            && let Err(e) = self.persist(&mut state, &[counterparty])
        {
            tracing::warn!("Could not persist read state for {}: {}", counterparty, e);
        }
        changed
    }

    pub fn conversation(&self, counterparty: &str) -> Vec<ChatMessage> {
        self.lock()
            .cache
            .get(counterparty)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn pending_messages(&self) -> Vec<PendingMessage> {
        self.lock().pending.clone()
    }

    /// Whether a flush would try to send anything.
    pub fn has_deliverable(&self) -> bool {
        self.lock()
            .pending
            .iter()
            .any(|p| p.state != DeliveryState::Failed)
    }

    /// Reload the outbox and cached conversations from the store.
    ///
    /// Returns the number of queued entries recovered.
    pub fn restore(&self) -> Result<usize> {
        let pending: Vec<PendingMessage> = match self.store.get(storage_keys::OUTBOX)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                key: storage_keys::OUTBOX.to_string(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        let index: Vec<String> = match self.store.get(storage_keys::CONVERSATION_INDEX)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Discarding corrupt conversation index: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut cache = ConversationCache::default();
        let mut sizes = HashMap::new();
        for counterparty in index {
            let key = conversation_key(&counterparty);
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<ConversationSnapshot>(&raw) {
                Ok(snapshot) => {
                    sizes.insert(counterparty, raw.len());
                    cache.insert(snapshot);
                }
                Err(e) => {
                    tracing::warn!("Discarding corrupt conversation {}: {}", key, e);
                    let _ = self.store.remove(&key);
                }
            }
        }

        // Optimistic messages whose outbox entry never got persisted are dropped,
        // queued entries missing from their conversation are re-added
        let queued: HashSet<MessageId> = pending.iter().map(|p| p.id.clone()).collect();
        for counterparty in cache.counterparties() {
            if let Some(conversation) = cache.get_mut(&counterparty) {
                conversation.messages.retain(|m| {
                    !m.id.is_temporary() || queued.contains(&m.id) || m.status == DeliveryState::Sent
                });
            }
        }
        for entry in &pending {
            let conversation = cache.entry(&entry.payload.recipient_id, entry.created_at);
            if !conversation.contains(&entry.id) {
                conversation.insert_sorted(entry.to_chat_message(), entry.created_at);
            }
        }

        let restored = pending.len();
        let mut state = self.lock();
        state.pending = pending;
        state.cache = cache;
        state.sizes = sizes;
        state.in_flight = None;
        tracing::info!(
            "Restored {} queued message(s) and {} conversation(s)",
            restored,
            state.sizes.len()
        );
        Ok(restored)
    }

    /// Write the outbox, the index and the touched conversations, evicting
    /// idle conversations to stay within the storage budget.
    fn persist(&self, state: &mut OutboxState, touched: &[&str]) -> Result<()> {
        let outbox = serde_json::to_string(&state.pending)?;
        let mut written: Vec<(String, String)> = Vec::with_capacity(touched.len());
        for counterparty in touched {
            if let Some(conversation) = state.cache.get(counterparty) {
                written.push((counterparty.to_string(), serde_json::to_string(conversation)?));
            }
        }

        let mut protected: HashSet<String> = state
            .pending
            .iter()
            .map(|p| p.payload.recipient_id.clone())
            .collect();
        protected.extend(touched.iter().map(|c| c.to_string()));

        loop {
            let total = self.projected_size(state, &outbox, &written);
            if total <= self.options.storage_budget_bytes {
                break;
            }
            if !self.evict_one(state, &protected) {
                return Err(RealtimeError::Storage(StorageError::QuotaExceeded {
                    key: storage_keys::OUTBOX.to_string(),
                    bytes: total,
                }));
            }
        }

        for (counterparty, raw) in &written {
            self.write_with_eviction(state, &conversation_key(counterparty), raw, &protected)?;
            state.sizes.insert(counterparty.clone(), raw.len());
        }
        self.write_with_eviction(state, storage_keys::OUTBOX, &outbox, &protected)?;
        let index = serde_json::to_string(&state.cache.counterparties())?;
        self.write_with_eviction(state, storage_keys::CONVERSATION_INDEX, &index, &protected)?;
        Ok(())
    }

    fn projected_size(&self, state: &OutboxState, outbox: &str, written: &[(String, String)]) -> usize {
        let rewritten: HashMap<&str, usize> = written
            .iter()
            .map(|(c, raw)| (c.as_str(), raw.len()))
            .collect();
        let conversations: usize = state
            .cache
            .counterparties()
            .iter()
            .map(|c| {
                rewritten
                    .get(c.as_str())
                    .copied()
                    .unwrap_or_else(|| state.sizes.get(c).copied().unwrap_or(0))
            })
            .sum();
        let index: usize = state.cache.counterparties().iter().map(|c| c.len() + 3).sum();
        outbox.len() + conversations + index
    }

    fn evict_one(&self, state: &mut OutboxState, protected: &HashSet<String>) -> bool {
        let Some(victim) = state.cache.least_recent(protected) else {
            return false;
        };
        tracing::info!("Evicting cached conversation with {} to stay within budget", victim);
        state.cache.remove(&victim);
        state.sizes.remove(&victim);
        if let Err(e) = self.store.remove(&conversation_key(&victim)) {
            tracing::warn!("Could not remove evicted conversation {}: {}", victim, e);
        }
        true
    }

    /// The store's own quota is enforced by evicting and retrying.
    fn write_with_eviction(
        &self,
        state: &mut OutboxState,
        key: &str,
        value: &str,
        protected: &HashSet<String>,
    ) -> Result<()> {
        loop {
            match self.store.set(key, value) {
                Ok(()) => return Ok(()),
                Err(StorageError::QuotaExceeded { .. }) if self.evict_one(state, protected) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn conversation_key(counterparty: &str) -> String {
    format!("{}{}", storage_keys::CONVERSATION_PREFIX, counterparty)
}
