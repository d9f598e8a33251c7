use super::{ChatCoordinator, CoordinatorState};
use crate::channel::{ChannelMultiplexer, KnownTables, MultiplexerOptions};
use crate::infrastructure::{Clock, ReconnectPolicy, SystemClock};
use crate::messaging::{EventRouter, InvalidationMap};
use crate::outbox::{LocalStore, Outbox, OutboxOptions};
use crate::presence::{PresenceOptions, PresenceTracker, TypingTracker};
use crate::remote::{Notifier, RemoteService, TracingNotifier};
use crate::types::{COALESCE_WINDOW, RealtimeError, Result, UNSUBSCRIBE_GRACE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Identity of the signed-in user. Required.
    pub self_user_id: String,
    pub policy: ReconnectPolicy,
    pub unsubscribe_grace: Duration,
    pub coalesce_window: Duration,
    pub invalidations: InvalidationMap,
    pub known_tables: KnownTables,
    pub outbox: OutboxOptions,
    pub presence: PresenceOptions,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            self_user_id: String::new(),
            policy: ReconnectPolicy::default(),
            unsubscribe_grace: Duration::from_millis(UNSUBSCRIBE_GRACE),
            coalesce_window: Duration::from_millis(COALESCE_WINDOW),
            invalidations: InvalidationMap::default(),
            known_tables: KnownTables::default(),
            outbox: OutboxOptions::default(),
            presence: PresenceOptions::default(),
        }
    }
}

impl CoordinatorOptions {
    pub fn for_user(self_user_id: impl Into<String>) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            ..Default::default()
        }
    }
}

/// Builder for ChatCoordinator that wires its components together
pub struct CoordinatorBuilder {
    remote: Arc<dyn RemoteService>,
    store: Arc<dyn LocalStore>,
    options: CoordinatorOptions,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl CoordinatorBuilder {
    /// Create a new builder
    pub fn new(
        remote: Arc<dyn RemoteService>,
        store: Arc<dyn LocalStore>,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        // Everything is scoped to the signed-in user
        if options.self_user_id.trim().is_empty() {
            return Err(RealtimeError::Auth("self_user_id is required".to_string()));
        }

        Ok(Self {
            remote,
            store,
            options,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the coordinator. Must be called inside a tokio runtime.
    ///
    /// Nothing is restored or subscribed until [`ChatCoordinator::start`].
    pub fn build(self) -> ChatCoordinator {
        let options = self.options;
        let self_id = options.self_user_id.clone();

        let router = Arc::new(EventRouter::new(
            options.coalesce_window,
            options.invalidations.clone(),
        ));
        let multiplexer = ChannelMultiplexer::new(
            Arc::clone(&self.remote),
            Arc::clone(&router),
            MultiplexerOptions {
                policy: options.policy,
                unsubscribe_grace: options.unsubscribe_grace,
                known_tables: options.known_tables.clone(),
            },
        );
        let outbox = Arc::new(Outbox::new(
            self_id.clone(),
            self.store,
            Arc::clone(&self.clock),
            options.outbox.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            self_id.clone(),
            Arc::clone(&self.clock),
            options.presence.staleness_window,
        ));
        let typing = TypingTracker::new(
            self_id,
            self.clock,
            Arc::clone(&self.remote),
            options.presence.typing_expiry,
        );

        ChatCoordinator {
            options: Arc::new(options),
            remote: self.remote,
            multiplexer,
            router,
            outbox,
            presence,
            typing,
            notifier: self.notifier,
            state: Arc::new(RwLock::new(CoordinatorState::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryStore;
    use crate::testing::MockRemote;

    #[test]
    fn test_builder_requires_self_user_id() {
        let result = CoordinatorBuilder::new(
            MockRemote::new(),
            Arc::new(MemoryStore::new()),
            CoordinatorOptions::for_user("  "),
        );
        assert!(matches!(result, Err(RealtimeError::Auth(_))));
    }

    #[test]
    fn test_default_options_use_documented_constants() {
        let options = CoordinatorOptions::for_user("A");
        assert_eq!(options.unsubscribe_grace, Duration::from_secs(1));
        assert_eq!(options.coalesce_window, Duration::from_millis(500));
        assert_eq!(options.outbox.max_delivery_attempts, 3);
        assert_eq!(options.presence.staleness_window, Duration::from_secs(120));
    }
}
