use super::descriptor::{ChannelKey, KnownTables, SubscriptionDescriptor, TableFilter};
use super::postgres_changes::PostgresChangesPayload;
use super::state::{
    ChannelHandle, HandleStatus, RegistryState, SubscriberCallback, SubscriberEntry, SubscriberId,
};
use crate::infrastructure::{ReconnectPolicy, TaskManager};
use crate::messaging::{EventRouter, RouteTarget};
use crate::remote::{RemoteService, TransportEvent};
use crate::types::{Result, UNSUBSCRIBE_GRACE};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};

/// Aggregate link health, for an offline indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Tuning for the multiplexer.
#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    pub policy: ReconnectPolicy,
    /// How long a channel with no subscribers stays open
    pub unsubscribe_grace: Duration,
    pub known_tables: KnownTables,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            unsubscribe_grace: Duration::from_millis(UNSUBSCRIBE_GRACE),
            known_tables: KnownTables::default(),
        }
    }
}

struct Detach {
    id: SubscriberId,
    active: Arc<AtomicBool>,
}

/// Cancel capability returned by [`ChannelMultiplexer::subscribe`].
///
/// Delivery stops as soon as `unsubscribe` returns (or the value is dropped);
/// the registry cleanup and channel teardown happen in the background.
pub struct Subscription {
    id: SubscriberId,
    active: Arc<AtomicBool>,
    detach_tx: mpsc::UnboundedSender<Detach>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.detach_tx.send(Detach {
                id: self.id.clone(),
                active: Arc::clone(&self.active),
            });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Opening {
    name: String,
    filters: Vec<TableFilter>,
    epoch: u64,
}

enum ErrorAction {
    Retry { name: String, delay: Duration, epoch: u64 },
    Fail { name: String, targets: Vec<RouteTarget> },
}

struct Shared {
    remote: Arc<dyn RemoteService>,
    registry: RwLock<RegistryState>,
    router: Arc<EventRouter>,
    options: MultiplexerOptions,
    detach_tx: mpsc::UnboundedSender<Detach>,
    connectivity: watch::Sender<Connectivity>,
    online: AtomicBool,
    tasks: Mutex<TaskManager>,
}

/// Maps many logical subscriptions onto the minimum set of realtime channels.
///
/// One channel is open per [`ChannelKey`]. Subscribers attach and detach
/// freely; the channel is reconnected with exponential backoff on errors
/// and closed a grace period after its last subscriber leaves.
#[derive(Clone)]
pub struct ChannelMultiplexer {
    shared: Arc<Shared>,
}

impl ChannelMultiplexer {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        router: Arc<EventRouter>,
        options: MultiplexerOptions,
    ) -> Self {
        let (detach_tx, detach_rx) = mpsc::unbounded_channel();
        let (connectivity, _) = watch::channel(Connectivity::Connected);
        let shared = Arc::new(Shared {
            remote,
            registry: RwLock::new(RegistryState::default()),
            router,
            options,
            detach_tx,
            connectivity,
            online: AtomicBool::new(true),
            tasks: Mutex::new(TaskManager::new()),
        });
        shared.spawn(Shared::detach_loop(Arc::downgrade(&shared), detach_rx));
        Self { shared }
    }

    /// Attach `id` to the channel for `descriptor`, opening it if needed.
    ///
    /// Idempotent per subscriber id: subscribing again replaces the callback
    /// (and moves the subscriber if the key changed). Malformed descriptors
    /// fail immediately with [`RealtimeError::InvalidDescriptor`](crate::RealtimeError).
    pub async fn subscribe(
        &self,
        descriptor: SubscriptionDescriptor,
        id: SubscriberId,
        callback: SubscriberCallback,
    ) -> Result<Subscription> {
        descriptor.validate(&self.shared.options.known_tables)?;
        let key = descriptor.key();
        let active = Arc::new(AtomicBool::new(true));

        let (opening, released) = {
            let mut registry = self.shared.registry.write().await;

            let mut released = None;
            if let Some(previous) = registry.subscribers.remove(&id) {
                // The previous Subscription value becomes inert
                previous.active.store(false, Ordering::Release);
                if previous.key != key {
                    released = Shared::release(&mut registry, &id, &previous.key)
                        .map(|generation| (previous.key.clone(), generation));
                }
            }

            let name = (!registry.handles.contains_key(&key)).then(|| registry.channel_name(&key));
            let epoch = registry.next_epoch();
            let handle = registry
                .handles
                .entry(key.clone())
                .or_insert_with(|| ChannelHandle::new(name.unwrap_or_default(), key.clone()));
            handle.subscribers.insert(id.clone());
            // Cancels a teardown scheduled by the previous last subscriber
            handle.teardown_generation += 1;

            let opening = match handle.status {
                HandleStatus::Idle => Shared::begin_open(handle, epoch),
                HandleStatus::Failed => {
                    tracing::info!(channel = %handle.name, "Recreating failed channel");
                    handle.retry_count = 0;
                    Shared::begin_open(handle, epoch)
                }
                _ => {
                    tracing::debug!(channel = %handle.name, subscriber = %id, "Attaching to existing channel");
                    None
                }
            };

            registry.subscribers.insert(
                id.clone(),
                SubscriberEntry {
                    descriptor,
                    key: key.clone(),
                    callback,
                    active: Arc::clone(&active),
                },
            );
            (opening, released)
        };

        if let Some((old_key, generation)) = released {
            self.shared.schedule_teardown(old_key, generation);
        }
        self.shared.publish_connectivity().await;
        if let Some(opening) = opening {
            Arc::clone(&self.shared).finish_open(key, opening).await;
        }

        Ok(Subscription {
            id,
            active,
            detach_tx: self.shared.detach_tx.clone(),
        })
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.shared.connectivity.subscribe()
    }

    pub fn current_connectivity(&self) -> Connectivity {
        *self.shared.connectivity.borrow()
    }

    /// Record the device's network state. Coming back online recreates
    /// channels that had given up.
    pub async fn set_network_online(&self, online: bool) {
        let was_online = self.shared.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            tracing::info!("Network back online");
            let revived: Vec<(ChannelKey, Opening)> = {
                let mut registry = self.shared.registry.write().await;
                let RegistryState {
                    handles, epoch_seq, ..
                } = &mut *registry;
                handles
                    .values_mut()
                    .filter(|h| h.status == HandleStatus::Failed && !h.subscribers.is_empty())
                    .filter_map(|handle| {
                        handle.retry_count = 0;
                        *epoch_seq += 1;
                        Shared::begin_open(handle, *epoch_seq)
                            .map(|opening| (handle.key.clone(), opening))
                    })
                    .collect()
            };
            for (key, opening) in revived {
                Arc::clone(&self.shared).finish_open(key, opening).await;
            }
        } else if !online && was_online {
            tracing::info!("Network offline");
        }
        self.shared.publish_connectivity().await;
    }

    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::Acquire)
    }

    pub async fn handle_count(&self) -> usize {
        self.shared.registry.read().await.handles.len()
    }

    pub async fn handle_status(&self, key: &ChannelKey) -> Option<HandleStatus> {
        self.shared
            .registry
            .read()
            .await
            .handles
            .get(key)
            .map(|h| h.status)
    }

    pub async fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.shared
            .registry
            .read()
            .await
            .handles
            .get(key)
            .map_or(0, |h| h.subscribers.len())
    }

    /// Close every channel and stop background work. The multiplexer is
    /// unusable afterwards.
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let mut registry = self.shared.registry.write().await;
            for entry in registry.subscribers.values() {
                entry.active.store(false, Ordering::Release);
            }
            registry.subscribers.clear();
            registry.handles.drain().map(|(_, h)| h.name).collect()
        };
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();

        for name in names {
            if let Err(e) = self.shared.remote.close_channel(&name).await {
                tracing::warn!(channel = %name, "Failed to close channel on shutdown: {}", e);
            }
        }
        tracing::info!("Channel multiplexer shut down");
    }
}

impl Shared {
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(future);
    }

    fn begin_open(handle: &mut ChannelHandle, epoch: u64) -> Option<Opening> {
        if !handle.transition(HandleStatus::Connecting) {
            return None;
        }
        handle.epoch = epoch;
        Some(Opening {
            name: handle.name.clone(),
            filters: handle.key.filters().to_vec(),
            epoch: handle.epoch,
        })
    }

    /// Boxed so the spawn cycle (open, pump, error, reconnect, open) has a
    /// nameable `Send` future.
    fn finish_open(self: Arc<Self>, key: ChannelKey, opening: Opening) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::info!(channel = %opening.name, "Opening channel for {}", key);
            match self
                .remote
                .open_channel(&opening.name, &opening.filters)
                .await
            {
                Ok(events) => {
                    self.spawn(Self::pump(Arc::downgrade(&self), key, opening.epoch, events));
                }
                Err(e) => {
                    self.on_channel_error(&key, opening.epoch, e.to_string())
                        .await;
                }
            }
        })
    }

    /// Drains one channel's transport events in order.
    async fn pump(
        shared: Weak<Self>,
        key: ChannelKey,
        epoch: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Subscribed => shared.on_subscribed(&key, epoch).await,
                TransportEvent::Change(payload) => shared.deliver(&key, epoch, payload).await,
                TransportEvent::Errored(reason) => {
                    shared.on_channel_error(&key, epoch, reason).await;
                    return;
                }
                TransportEvent::Closed => {
                    shared
                        .on_channel_error(&key, epoch, "channel closed by server".to_string())
                        .await;
                    return;
                }
            }
        }
        if let Some(shared) = shared.upgrade() {
            shared
                .on_channel_error(&key, epoch, "event stream ended".to_string())
                .await;
        }
    }

    async fn on_subscribed(&self, key: &ChannelKey, epoch: u64) {
        {
            let mut registry = self.registry.write().await;
            let Some(handle) = registry.handles.get_mut(key) else {
                return;
            };
            if handle.epoch != epoch {
                return;
            }
            if handle.transition(HandleStatus::Subscribed) {
                handle.retry_count = 0;
                tracing::info!(channel = %handle.name, "Channel subscribed");
            }
        }
        self.publish_connectivity().await;
    }

    async fn deliver(&self, key: &ChannelKey, epoch: u64, payload: PostgresChangesPayload) {
        let targets = {
            let registry = self.registry.read().await;
            match registry.handles.get(key) {
                Some(handle) if handle.epoch == epoch => Self::targets(&registry, handle),
                _ => {
                    tracing::debug!("Dropping change for stale channel {}", key);
                    return;
                }
            }
        };
        self.router.route(payload, &targets);
    }

    fn targets(registry: &RegistryState, handle: &ChannelHandle) -> Vec<RouteTarget> {
        handle
            .subscribers
            .iter()
            .filter_map(|id| {
                registry.subscribers.get(id).map(|entry| RouteTarget {
                    id: id.clone(),
                    descriptor: entry.descriptor.clone(),
                    callback: Arc::clone(&entry.callback),
                    active: Arc::clone(&entry.active),
                })
            })
            .collect()
    }

    async fn on_channel_error(self: &Arc<Self>, key: &ChannelKey, epoch: u64, reason: String) {
        let action = {
            let mut registry = self.registry.write().await;
            let Some(handle) = registry.handles.get_mut(key) else {
                return;
            };
            // Only the open attempt that is current may report an error, once
            if handle.epoch != epoch
                || !matches!(
                    handle.status,
                    HandleStatus::Connecting | HandleStatus::Subscribed
                )
            {
                return;
            }
            tracing::warn!(channel = %handle.name, "Channel error: {}", reason);
            handle.transition(HandleStatus::Errored);
            handle.retry_count += 1;

            match self.options.policy.delay_for(handle.retry_count) {
                Some(delay) => {
                    handle.transition(HandleStatus::Reconnecting);
                    ErrorAction::Retry {
                        name: handle.name.clone(),
                        delay,
                        epoch,
                    }
                }
                None => {
                    handle.transition(HandleStatus::Failed);
                    tracing::error!(
                        channel = %handle.name,
                        "Channel failed after {} attempts",
                        handle.retry_count - 1
                    );
                    let name = handle.name.clone();
                    let handle = &registry.handles[key];
                    ErrorAction::Fail {
                        name,
                        targets: Self::targets(&registry, handle),
                    }
                }
            }
        };
        self.publish_connectivity().await;

        match action {
            ErrorAction::Retry { name, delay, epoch } => {
                tracing::info!(channel = %name, "Reconnecting in {:?}", delay);
                self.spawn(Self::reconnect_after(
                    Arc::downgrade(self),
                    key.clone(),
                    epoch,
                    delay,
                ));
            }
            ErrorAction::Fail { name, targets } => {
                if let Err(e) = self.remote.close_channel(&name).await {
                    tracing::debug!(channel = %name, "Close after failure errored: {}", e);
                }
                self.router.broadcast_failure(&name, &reason, &targets);
            }
        }
    }

    async fn reconnect_after(shared: Weak<Self>, key: ChannelKey, epoch: u64, delay: Duration) {
        tokio::time::sleep(delay).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let opening = {
            let mut registry = shared.registry.write().await;
            let Some(handle) = registry.handles.get_mut(&key) else {
                return;
            };
            if handle.epoch != epoch || handle.status != HandleStatus::Reconnecting {
                return;
            }
            let name = handle.name.clone();
            drop(registry);
            // Release the server side of the broken channel before rejoining
            if let Err(e) = shared.remote.close_channel(&name).await {
                tracing::debug!(channel = %name, "Close before reconnect errored: {}", e);
            }
            let mut registry = shared.registry.write().await;
            let next_epoch = registry.next_epoch();
            let Some(handle) = registry.handles.get_mut(&key) else {
                return;
            };
            if handle.epoch != epoch || handle.status != HandleStatus::Reconnecting {
                return;
            }
            Self::begin_open(handle, next_epoch)
        };

        if let Some(opening) = opening {
            shared.finish_open(key, opening).await;
        }
    }

    fn release(registry: &mut RegistryState, id: &SubscriberId, key: &ChannelKey) -> Option<u64> {
        let handle = registry.handles.get_mut(key)?;
        handle.subscribers.remove(id);
        if handle.subscribers.is_empty() {
            handle.teardown_generation += 1;
            Some(handle.teardown_generation)
        } else {
            None
        }
    }

    async fn detach_loop(shared: Weak<Self>, mut detaches: mpsc::UnboundedReceiver<Detach>) {
        while let Some(detach) = detaches.recv().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.detach(detach).await;
        }
    }

    async fn detach(self: &Arc<Self>, detach: Detach) {
        let released = {
            let mut registry = self.registry.write().await;
            // A resubscribe may have replaced the entry since
            let current = registry
                .subscribers
                .get(&detach.id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.active, &detach.active));
            if !current {
                return;
            }
            let Some(entry) = registry.subscribers.remove(&detach.id) else {
                return;
            };
            tracing::debug!(subscriber = %detach.id, "Detached from {}", entry.key);
            Self::release(&mut registry, &detach.id, &entry.key).map(|g| (entry.key, g))
        };
        if let Some((key, generation)) = released {
            self.schedule_teardown(key, generation);
        }
    }

    fn schedule_teardown(self: &Arc<Self>, key: ChannelKey, generation: u64) {
        let shared = Arc::downgrade(self);
        let grace = self.options.unsubscribe_grace;
        self.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let name = {
                let mut registry = shared.registry.write().await;
                match registry.handles.get(&key) {
                    Some(h) if h.teardown_generation == generation && h.subscribers.is_empty() => {}
                    _ => return,
                }
                registry.handles.remove(&key).map(|h| h.name)
            };
            if let Some(name) = name {
                tracing::info!(channel = %name, "Closing idle channel");
                if let Err(e) = shared.remote.close_channel(&name).await {
                    tracing::warn!(channel = %name, "Failed to close channel: {}", e);
                }
            }
            shared.publish_connectivity().await;
        });
    }

    async fn publish_connectivity(&self) {
        let next = if !self.online.load(Ordering::Acquire) {
            Connectivity::Disconnected
        } else {
            let registry = self.registry.read().await;
            let statuses = registry.handles.values();
            let mut next = Connectivity::Connected;
            for handle in statuses {
                match handle.status {
                    HandleStatus::Failed => {
                        next = Connectivity::Disconnected;
                        break;
                    }
                    HandleStatus::Errored | HandleStatus::Closed | HandleStatus::Reconnecting => {
                        next = Connectivity::Reconnecting;
                    }
                    HandleStatus::Connecting if handle.retry_count > 0 => {
                        next = Connectivity::Reconnecting;
                    }
                    _ => {}
                }
            }
            next
        };
        self.connectivity.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!("Connectivity {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }
}
