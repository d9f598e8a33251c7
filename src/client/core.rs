use super::{CoordinatorOptions, CoordinatorState};
use crate::channel::{
    ChannelMultiplexer, Connectivity, ParticipantFilter, SubscriberId, Subscription,
    SubscriptionDescriptor, TableFilter,
};
use crate::infrastructure::{Backoff, ReconnectPolicy};
use crate::messaging::{EventRouter, SubscriberEvent};
use crate::outbox::{FlushOutcome, Outbox, RemoteApply};
use crate::presence::{
    PRESENCE_CONFLICT_COLUMN, PresenceHeartbeat, PresenceTracker, TypingTracker, Visibility,
};
use crate::remote::{Notifier, RemoteService};
use crate::types::{
    Attachment, CallbackError, ChatMessage, MessageId, PendingMessage, PresenceState, RealtimeError,
    Result, SendPayload, rpc, tables,
};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

const MESSAGES_SUBSCRIBER: &str = "coordinator:messages";
const PRESENCE_SUBSCRIBER: &str = "coordinator:presence";
const TYPING_SUBSCRIBER: &str = "coordinator:typing";

/// Entry point for the chat layer of an app.
///
/// Owns one [`ChannelMultiplexer`], the [`Outbox`], and the presence and
/// typing trackers for a single signed-in user. Cloning is cheap and every
/// clone drives the same coordinator.
///
/// # Example
///
/// ```no_run
/// use chat_realtime_rs::{CoordinatorBuilder, CoordinatorOptions, MemoryStore, SupabaseOptions, SupabaseService};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let remote = Arc::new(SupabaseService::new(SupabaseOptions::from_env()?)?);
/// let coordinator = CoordinatorBuilder::new(
///     remote,
///     Arc::new(MemoryStore::new()),
///     CoordinatorOptions::for_user("user-a"),
/// )?
/// .build();
///
/// coordinator.start().await?;
/// coordinator.send("user-b", "hi", None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChatCoordinator {
    pub(crate) options: Arc<CoordinatorOptions>,
    pub(crate) remote: Arc<dyn RemoteService>,
    pub(crate) multiplexer: ChannelMultiplexer,
    pub(crate) router: Arc<EventRouter>,
    pub(crate) outbox: Arc<Outbox>,
    pub(crate) presence: Arc<PresenceTracker>,
    pub(crate) typing: Arc<TypingTracker>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) state: Arc<RwLock<CoordinatorState>>,
}

impl ChatCoordinator {
    pub fn self_id(&self) -> &str {
        &self.options.self_user_id
    }

    /// Restores the outbox and begins the session.
    ///
    /// Subscribes to our messages, presence rows and typing indicators,
    /// publishes `Online`, starts the presence heartbeat, and flushes
    /// anything left queued by a previous run. Calling `start` twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted outbox cannot be read. Cached
    /// conversations that fail to decode are skipped instead.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(RealtimeError::Connection(
                    "coordinator was shut down".to_string(),
                ));
            }
            if state.started {
                return Ok(());
            }

            let restored = self.outbox.restore()?;
            tracing::info!(
                user = %self.self_id(),
                "Starting chat coordinator ({} queued message(s) restored)",
                restored
            );
            // Claimed before the channels open so a concurrent start is a no-op
            state.started = true;
        }

        let subscriptions = match self.open_internal_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                self.state.write().await.started = false;
                return Err(e);
            }
        };

        let mut state = self.state.write().await;
        if state.closed {
            return Err(RealtimeError::Connection(
                "coordinator was shut down while starting".to_string(),
            ));
        }
        state.subscriptions = subscriptions;

        // Connectivity watcher: flush whenever the link comes back
        let mut rx = self.multiplexer.connectivity();
        let coordinator = self.clone();
        state.task_manager.spawn(async move {
            let mut previous = *rx.borrow_and_update();
            while rx.changed().await.is_ok() {
                let current = *rx.borrow_and_update();
                if current == Connectivity::Connected && previous != Connectivity::Connected {
                    tracing::info!("Connectivity restored, flushing outbox");
                    coordinator.flush().await;
                }
                previous = current;
            }
            tracing::info!("Connectivity watcher task finished");
        });

        let heartbeat = PresenceHeartbeat::new(Arc::downgrade(&self.presence), Arc::clone(&self.remote))
            .with_interval(self.options.presence.heartbeat_interval)
            .spawn();
        state.task_manager.track(heartbeat);
        drop(state);

        if let Err(e) = self.heartbeat(PresenceState::Online).await {
            tracing::warn!("Could not publish initial presence: {}", e);
        }
        if self.outbox.has_deliverable() && self.multiplexer.is_online() {
            self.spawn_flush().await;
        }
        Ok(())
    }

    /// Ends the session.
    ///
    /// Publishes `Offline` and clears our typing indicators through the
    /// non-blocking beacon path, then closes every channel and stops
    /// background work. Queued messages stay persisted for the next
    /// coordinator built on the same store; this one cannot be restarted.
    pub async fn shutdown(&self) {
        let was_started = {
            let mut state = self.state.write().await;
            if state.closed {
                return;
            }
            let was_started = state.started;
            state.reset();
            state.closed = true;
            was_started
        };

        if was_started {
            let row = self.presence.local_update(PresenceState::Offline);
            match serde_json::to_value(&row) {
                Ok(row) => {
                    self.remote
                        .beacon(tables::USER_PRESENCE, row, PRESENCE_CONFLICT_COLUMN)
                }
                Err(e) => tracing::error!("Could not encode presence row: {}", e),
            }
            self.typing.beacon_stop_all();
        }

        self.multiplexer.shutdown().await;
        tracing::info!("Chat coordinator shut down");
    }

    /// Registers interest in table changes.
    ///
    /// Subscribers whose descriptors share a topic and table filters share
    /// one underlying channel. Delivery stops as soon as the returned
    /// [`Subscription`] is unsubscribed or dropped.
    ///
    /// # Errors
    ///
    /// Fails synchronously with `InvalidDescriptor` for malformed descriptors.
    pub async fn subscribe<F>(
        &self,
        descriptor: SubscriptionDescriptor,
        subscriber_id: impl Into<SubscriberId>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(&SubscriberEvent) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.multiplexer
            .subscribe(descriptor, subscriber_id.into(), Arc::new(callback))
            .await
    }

    /// Like [`subscribe`](Self::subscribe) under a freshly generated
    /// subscriber id, for listeners that never re-subscribe.
    pub async fn listen<F>(
        &self,
        descriptor: SubscriptionDescriptor,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(&SubscriberEvent) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.subscribe(descriptor, SubscriberId::generate(), callback)
            .await
    }

    /// Sets the hook receiving coalesced cache-invalidation keys.
    pub fn on_invalidate<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.router.set_invalidation_hook(Arc::new(hook));
    }

    /// Aggregate connectivity for an offline indicator.
    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.multiplexer.connectivity()
    }

    /// Record the device's network state. Coming back online revives
    /// failed channels and flushes the outbox.
    pub async fn set_network_online(&self, online: bool) {
        self.multiplexer.set_network_online(online).await;
        if online && self.outbox.has_deliverable() {
            self.spawn_flush().await;
        }
    }

    /// Sends a message to `recipient_id`.
    ///
    /// The message is queued, persisted and shown in the conversation under a
    /// temporary id before this returns. Delivery happens in the background
    /// while online, or on the next reconnect.
    ///
    /// # Errors
    ///
    /// `InvalidMessage` for empty payloads, `Storage` if the outbox cannot be
    /// persisted. Nothing is queued in either case.
    pub async fn send(
        &self,
        recipient_id: &str,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<PendingMessage> {
        let mut payload = SendPayload::new(recipient_id, content);
        if let Some(attachment) = attachment {
            payload = payload.with_attachment(attachment);
        }
        let pending = self.outbox.enqueue_send(payload)?;

        self.typing.stop_typing(recipient_id).await;
        if self.multiplexer.is_online() {
            self.spawn_flush().await;
        } else {
            tracing::debug!(id = %pending.id, "Offline, message stays queued");
        }
        Ok(pending)
    }

    /// The cached conversation with `user_id`, oldest first.
    pub fn get_conversation(&self, user_id: &str) -> Vec<ChatMessage> {
        self.outbox.conversation(user_id)
    }

    pub fn pending_messages(&self) -> Vec<PendingMessage> {
        self.outbox.pending_messages()
    }

    /// Runs one delivery pass now.
    ///
    /// An interrupted pass schedules a retry with backoff, starting at
    /// `OutboxOptions::retry_base_delay`.
    pub async fn flush(&self) -> FlushOutcome {
        let outcome = self.outbox.flush(self.remote.as_ref()).await;
        if let FlushOutcome::Interrupted { delivered, error } = &outcome {
            tracing::warn!("Flush interrupted after {} message(s): {}", delivered, error);
            self.schedule_flush_retry().await;
        }
        outcome
    }

    /// Requeue a `Failed` message with a fresh attempt budget.
    pub async fn retry_failed(&self, id: &MessageId) -> Result<bool> {
        let requeued = self.outbox.retry_failed(id)?;
        if requeued && self.multiplexer.is_online() {
            self.spawn_flush().await;
        }
        Ok(requeued)
    }

    /// Drop a `Failed` message and its optimistic copy.
    pub fn discard_failed(&self, id: &MessageId) -> Result<bool> {
        self.outbox.discard_failed(id)
    }

    /// Marks everything `counterparty` sent us as read, locally first and then
    /// on the server.
    pub async fn mark_conversation_read(&self, counterparty: &str) -> Result<usize> {
        let changed = self.outbox.mark_read_local(counterparty);
        self.remote
            .rpc(
                rpc::MARK_MESSAGES_READ,
                serde_json::json!({
                    "p_sender_id": counterparty,
                    "p_recipient_id": self.self_id(),
                }),
            )
            .await?;
        Ok(changed)
    }

    /// Presence of `user_id`, `Offline` once the last heartbeat is stale.
    pub fn get_status(&self, user_id: &str) -> PresenceState {
        self.presence.get_status(user_id)
    }

    /// Record and publish our own presence.
    pub async fn heartbeat(&self, status: PresenceState) -> Result<()> {
        let row = self.presence.local_update(status);
        self.remote
            .upsert(
                tables::USER_PRESENCE,
                serde_json::to_value(&row)?,
                PRESENCE_CONFLICT_COLUMN,
            )
            .await
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> Result<()> {
        self.heartbeat(visibility.presence()).await
    }

    /// The conversation currently on screen. Incoming messages for it do not
    /// raise notifications.
    pub fn set_viewing(&self, counterparty: Option<&str>) {
        self.presence.set_viewing(counterparty.map(str::to_string));
    }

    pub async fn keystroke(&self, counterparty: &str) {
        self.typing.keystroke(counterparty).await;
    }

    pub async fn stop_typing(&self, counterparty: &str) {
        self.typing.stop_typing(counterparty).await;
    }

    /// Whether `user_id` is currently typing to us.
    pub fn is_typing(&self, user_id: &str) -> bool {
        self.typing.is_typing(user_id)
    }

    async fn spawn_flush(&self) {
        let coordinator = self.clone();
        let mut state = self.state.write().await;
        if state.closed {
            return;
        }
        state.task_manager.spawn(async move {
            coordinator.flush().await;
        });
    }

    async fn schedule_flush_retry(&self) {
        let mut state = self.state.write().await;
        if state.flush_retry_scheduled || state.closed {
            return;
        }
        state.flush_retry_scheduled = true;

        let outbox_options = self.outbox.options();
        let mut backoff = Backoff::new(ReconnectPolicy {
            base_delay: outbox_options.retry_base_delay,
            factor: 2,
            max_delay: outbox_options.retry_max_delay,
            max_attempts: u32::MAX,
        });
        let coordinator = self.clone();
        state.task_manager.spawn(async move {
            loop {
                tokio::time::sleep(backoff.next_delay_capped()).await;
                if coordinator.end_retry_if_idle().await {
                    break;
                }
                match coordinator.outbox.flush(coordinator.remote.as_ref()).await {
                    FlushOutcome::Interrupted { error, .. } => {
                        tracing::debug!(attempt = backoff.attempts(), "Flush retry failed: {}", error);
                    }
                    FlushOutcome::Completed { delivered } => {
                        tracing::debug!("Flush retry delivered {} message(s)", delivered);
                        if coordinator.end_retry_if_idle().await {
                            break;
                        }
                        if delivered > 0 {
                            backoff.reset();
                        }
                    }
                    FlushOutcome::AlreadyRunning => {}
                }
            }
            tracing::debug!("Flush retry task finished");
        });
    }

    /// Clears the retry flag when there is nothing left to retry.
    ///
    /// Checked under the state lock, so a pass failing concurrently either
    /// sees the flag still set or schedules a new retry.
    async fn end_retry_if_idle(&self) -> bool {
        let mut state = self.state.write().await;
        if self.outbox.has_deliverable() && self.multiplexer.is_online() {
            return false;
        }
        state.flush_retry_scheduled = false;
        true
    }

    async fn open_internal_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(vec![
            self.subscribe_messages().await?,
            self.subscribe_presence().await?,
            self.subscribe_typing().await?,
        ])
    }

    async fn subscribe_messages(&self) -> Result<Subscription> {
        let self_id = self.self_id().to_string();
        let outbox = Arc::clone(&self.outbox);
        let presence = Arc::clone(&self.presence);
        let notifier = Arc::clone(&self.notifier);

        let descriptor = SubscriptionDescriptor::new(format!("messages:{}", self_id))
            .table(TableFilter::new(tables::MESSAGES))
            .participants(ParticipantFilter::involving(self_id.clone()));

        self.subscribe(descriptor, MESSAGES_SUBSCRIBER, move |event| {
            match event {
                SubscriberEvent::Change(change) => {
                    if let RemoteApply::New(message) = outbox.apply_remote(change)
                        && message.recipient_id == self_id
                        && !presence.is_viewing(&message.sender_id)
                    {
                        notifier.notify(
                            &format!("New message from {}", message.sender_id),
                            &message.content,
                            &self_id,
                        );
                    }
                }
                SubscriberEvent::ChannelFailed { channel, reason } => {
                    tracing::warn!(channel = %channel, "Message feed lost: {}", reason);
                }
            }
            Ok(())
        })
        .await
    }

    async fn subscribe_presence(&self) -> Result<Subscription> {
        let presence = Arc::clone(&self.presence);
        let descriptor =
            SubscriptionDescriptor::new("presence").table(TableFilter::new(tables::USER_PRESENCE));

        self.subscribe(descriptor, PRESENCE_SUBSCRIBER, move |event| {
            if let SubscriberEvent::Change(change) = event {
                presence.record_change(change);
            }
            Ok(())
        })
        .await
    }

    async fn subscribe_typing(&self) -> Result<Subscription> {
        let typing = Arc::clone(&self.typing);
        let self_id = self.self_id();
        let descriptor = SubscriptionDescriptor::new(format!("typing:{}", self_id)).table(
            TableFilter::new(tables::TYPING_INDICATORS)
                .row_filter(format!("conversation_with=eq.{}", self_id)),
        );

        self.subscribe(descriptor, TYPING_SUBSCRIBER, move |event| {
            if let SubscriberEvent::Change(change) = event {
                typing.record_change(change);
            }
            Ok(())
        })
        .await
    }
}
