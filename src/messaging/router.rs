use super::coalesce::{Coalescer, InvalidationHook};
use super::event::{ChangeEvent, SubscriberEvent};
use crate::channel::{PostgresChangesPayload, SubscriberCallback, SubscriberId, SubscriptionDescriptor};
use crate::types::tables;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Maps a table to the query keys an external cache should refetch when it changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMap(HashMap<String, Vec<String>>);

impl InvalidationMap {
    pub fn empty() -> Self {
        Self(HashMap::new())
    }

    pub fn with<I, S>(mut self, table: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .insert(table.into(), keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn keys_for(&self, table: &str) -> &[String] {
        self.0.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for InvalidationMap {
    fn default() -> Self {
        Self::empty()
            .with(tables::MESSAGES, ["messages", "conversations"])
            .with(tables::POSTS, ["posts"])
            .with(tables::POST_COMMENTS, ["posts", "post_comments"])
            .with(tables::POST_LIKES, ["posts"])
            .with(tables::NOTIFICATIONS, ["notifications"])
            .with(tables::USER_PRESENCE, ["presence"])
            .with(tables::TRANSACTIONS, ["transactions", "insights"])
            .with(tables::INVOICES, ["invoices"])
            .with(tables::PAYMENTS, ["invoices", "payments"])
            .with(tables::GOALS, ["goals"])
    }
}

/// A subscriber attached to the channel an event arrived on.
#[derive(Clone)]
pub struct RouteTarget {
    pub id: SubscriberId,
    pub descriptor: SubscriptionDescriptor,
    pub callback: SubscriberCallback,
    pub active: Arc<AtomicBool>,
}

/// Dispatches inbound change notifications to subscriber callbacks and
/// coalesced invalidation signals.
pub struct EventRouter {
    coalescer: Coalescer,
    invalidations: InvalidationMap,
}

impl EventRouter {
    pub fn new(coalesce_window: Duration, invalidations: InvalidationMap) -> Self {
        Self {
            coalescer: Coalescer::new(coalesce_window),
            invalidations,
        }
    }

    pub fn set_invalidation_hook(&self, hook: InvalidationHook) {
        self.coalescer.set_hook(hook);
    }

    /// Routes one change to every matching target. Returns how many callbacks ran.
    pub fn route(&self, payload: PostgresChangesPayload, targets: &[RouteTarget]) -> usize {
        let event = ChangeEvent::from(payload);
        tracing::debug!(
            "Routing {} on {}.{} to {} candidate subscriber(s)",
            event.kind.as_str(),
            event.schema,
            event.table,
            targets.len()
        );

        let mut delivered = 0;
        let mut wrapped = None;
        for target in targets {
            if !target.active.load(Ordering::Acquire) || !target.descriptor.matches(&event) {
                continue;
            }
            let wrapped = wrapped.get_or_insert_with(|| SubscriberEvent::Change(event.clone()));
            Self::invoke(target, wrapped);
            delivered += 1;
        }

        for key in self.invalidations.keys_for(&event.table) {
            self.coalescer.signal(key);
        }

        delivered
    }

    /// Surfaces a terminal channel failure to every attached subscriber.
    pub fn broadcast_failure(&self, channel: &str, reason: &str, targets: &[RouteTarget]) {
        let event = SubscriberEvent::ChannelFailed {
            channel: channel.to_string(),
            reason: reason.to_string(),
        };
        for target in targets {
            if target.active.load(Ordering::Acquire) {
                Self::invoke(target, &event);
            }
        }
    }

    fn invoke(target: &RouteTarget, event: &SubscriberEvent) {
        match catch_unwind(AssertUnwindSafe(|| (target.callback)(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(subscriber = %target.id, "Subscriber callback failed: {}", e);
            }
            Err(_) => {
                tracing::error!(subscriber = %target.id, "Subscriber callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ParticipantFilter, TableFilter};
    use crate::messaging::ChangeKind;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn target(
        id: &str,
        descriptor: SubscriptionDescriptor,
        seen: Arc<Mutex<Vec<String>>>,
    ) -> RouteTarget {
        let name = id.to_string();
        RouteTarget {
            id: SubscriberId::new(id),
            descriptor,
            callback: Arc::new(move |event: &SubscriberEvent| {
                if let SubscriberEvent::Change(change) = event {
                    seen.lock().unwrap().push(format!(
                        "{}:{}",
                        name,
                        change.identity("id").unwrap_or_default()
                    ));
                }
                Ok(())
            }),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    fn message(id: &str, sender: &str, recipient: &str) -> PostgresChangesPayload {
        PostgresChangesPayload::new("public", "messages", ChangeKind::Insert).with_record(
            serde_json::json!({"id": id, "sender_id": sender, "recipient_id": recipient}),
        )
    }

    fn chat_with(peer: &str) -> SubscriptionDescriptor {
        SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::pair("A", peer))
    }

    #[tokio::test]
    async fn test_event_reaches_only_matching_conversation() {
        let router = EventRouter::new(Duration::from_millis(500), InvalidationMap::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let targets = vec![
            target("ab", chat_with("B"), Arc::clone(&seen)),
            target("ac", chat_with("C"), Arc::clone(&seen)),
        ];

        let delivered = router.route(message("m1", "B", "A"), &targets);

        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["ab:m1".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_isolated() {
        let router = EventRouter::new(Duration::from_millis(500), InvalidationMap::empty());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let descriptor = SubscriptionDescriptor::new("chat").table(TableFilter::new("messages"));

        let erroring = RouteTarget {
            id: SubscriberId::new("erroring"),
            descriptor: descriptor.clone(),
            callback: Arc::new(|_: &SubscriberEvent| Err("render failed".into())),
            active: Arc::new(AtomicBool::new(true)),
        };
        let panicking = RouteTarget {
            id: SubscriberId::new("panicking"),
            descriptor: descriptor.clone(),
            callback: Arc::new(|_: &SubscriberEvent| panic!("component unmounted")),
            active: Arc::new(AtomicBool::new(true)),
        };
        let targets = vec![
            erroring,
            panicking,
            target("healthy", descriptor, Arc::clone(&seen)),
        ];

        let delivered = router.route(message("m2", "B", "A"), &targets);

        assert_eq!(delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["healthy:m2".to_string()]);
    }

    #[tokio::test]
    async fn test_inactive_subscribers_are_skipped() {
        let router = EventRouter::new(Duration::from_millis(500), InvalidationMap::empty());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gone = target("gone", chat_with("B"), Arc::clone(&seen));
        gone.active.store(false, Ordering::Release);

        assert_eq!(router.route(message("m3", "A", "B"), &[gone]), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_update_collapses_into_one_invalidation_per_key() {
        let router = EventRouter::new(Duration::from_millis(500), InvalidationMap::default());
        let invalidated = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&invalidated);
        router.set_invalidation_hook(Arc::new(move |key: &str| {
            sink.lock().unwrap().push(key.to_string());
        }));

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let targets = vec![RouteTarget {
            id: SubscriberId::new("payments-screen"),
            descriptor: SubscriptionDescriptor::new("finance").table(TableFilter::new("payments")),
            callback: Arc::new(move |_: &SubscriberEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            active: Arc::new(AtomicBool::new(true)),
        }];

        for i in 0..50 {
            let payload = PostgresChangesPayload::new("public", "payments", ChangeKind::Update)
                .with_record(serde_json::json!({"id": i, "status": "confirmed"}));
            router.route(payload, &targets);
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Every row change is delivered, invalidations are merged
        assert_eq!(delivered.load(Ordering::SeqCst), 50);
        let mut keys = invalidated.lock().unwrap().clone();
        keys.sort();
        assert_eq!(keys, vec!["invoices".to_string(), "payments".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_failure_reaches_every_active_subscriber() {
        let router = EventRouter::new(Duration::from_millis(500), InvalidationMap::empty());
        let failures = Arc::new(AtomicUsize::new(0));
        let make = |id: &str| {
            let failures = Arc::clone(&failures);
            RouteTarget {
                id: SubscriberId::new(id),
                descriptor: chat_with("B"),
                callback: Arc::new(move |event: &SubscriberEvent| {
                    if matches!(event, SubscriberEvent::ChannelFailed { .. }) {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }),
                active: Arc::new(AtomicBool::new(true)),
            }
        };

        router.broadcast_failure("chat:1", "retry ceiling reached", &[make("a"), make("b")]);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }
}
