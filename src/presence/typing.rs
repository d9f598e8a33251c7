use crate::infrastructure::{Clock, TaskManager};
use crate::messaging::ChangeEvent;
use crate::remote::RemoteService;
use crate::types::tables;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;

const ON_CONFLICT: &str = "user_id,conversation_with";

#[derive(Debug, Deserialize)]
struct TypingRow {
    user_id: String,
    conversation_with: String,
    #[serde(default)]
    is_typing: bool,
}

struct LocalTyping {
    generation: u64,
    last_published: Instant,
}

#[derive(Default)]
struct TypingState {
    /// Counterpart we are typing to -> debounce generation
    local: HashMap<String, LocalTyping>,
    /// User typing to us -> when we last heard so
    remote: HashMap<String, DateTime<Utc>>,
    next_generation: u64,
}

/// Debounced "is typing" signalling, both directions.
pub struct TypingTracker {
    self_id: String,
    clock: Arc<dyn Clock>,
    remote: Arc<dyn RemoteService>,
    expiry: Duration,
    state: Mutex<TypingState>,
    timers: Mutex<TaskManager>,
}

impl TypingTracker {
    pub fn new(
        self_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        remote: Arc<dyn RemoteService>,
        expiry: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id: self_id.into(),
            clock,
            remote,
            expiry,
            state: Mutex::new(TypingState::default()),
            timers: Mutex::new(TaskManager::new()),
        })
    }

    /// Register a keystroke in the conversation with `counterpart`.
    ///
    /// The first keystroke publishes "typing" and continued typing
    /// refreshes it every half expiry, so the receiver's read-time expiry
    /// only lapses after real inactivity. Every keystroke re-arms the local
    /// expiry, and "stopped typing" is published once it lapses.
    pub async fn keystroke(self: &Arc<Self>, counterpart: &str) {
        let now = Instant::now();
        let refresh = self.expiry / 2;
        let (publish, generation) = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            let publish = match state.local.entry(counterpart.to_string()) {
                Entry::Occupied(mut entry) => {
                    let local = entry.get_mut();
                    local.generation = generation;
                    let stale = now.duration_since(local.last_published) >= refresh;
                    if stale {
                        local.last_published = now;
                    }
                    stale
                }
                Entry::Vacant(entry) => {
                    entry.insert(LocalTyping {
                        generation,
                        last_published: now,
                    });
                    true
                }
            };
            (publish, generation)
        };

        let tracker = Arc::downgrade(self);
        let counterpart_owned = counterpart.to_string();
        let expiry = self.expiry;
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                tokio::time::sleep(expiry).await;
                Self::expire(tracker, counterpart_owned, generation).await;
            });

        if publish {
            self.publish(counterpart, true).await;
        }
    }

    async fn expire(tracker: Weak<Self>, counterpart: String, generation: u64) {
        let Some(tracker) = tracker.upgrade() else {
            return;
        };
        let lapsed = {
            let mut state = tracker.lock();
            if state
                .local
                .get(&counterpart)
                .is_some_and(|local| local.generation == generation)
            {
                state.local.remove(&counterpart);
                true
            } else {
                false
            }
        };
        if lapsed {
            tracker.publish(&counterpart, false).await;
        }
    }

    /// Clear the typing state now, e.g. after the message was sent.
    pub async fn stop_typing(&self, counterpart: &str) {
        let was_typing = self.lock().local.remove(counterpart).is_some();
        if was_typing {
            self.publish(counterpart, false).await;
        }
    }

    pub fn is_local_typing(&self, counterpart: &str) -> bool {
        self.lock().local.contains_key(counterpart)
    }

    /// Apply a change on the `typing_indicators` table.
    pub fn record_change(&self, event: &ChangeEvent) {
        let Some(row) = event.row_value() else {
            return;
        };
        let row: TypingRow = match serde_json::from_value(row) {
            Ok(row) => row,
            Err(e) => {
                tracing::debug!("Ignoring malformed typing row: {}", e);
                return;
            }
        };
        if row.conversation_with != self.self_id || row.user_id == self.self_id {
            return;
        }
        let now = self.clock.now();
        let mut state = self.lock();
        if row.is_typing {
            state.remote.insert(row.user_id, now);
        } else {
            state.remote.remove(&row.user_id);
        }
    }

    /// Whether `user_id` is typing to us. Indicators lapse at read time.
    pub fn is_typing(&self, user_id: &str) -> bool {
        let expiry = chrono::Duration::from_std(self.expiry).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        self.lock()
            .remote
            .get(user_id)
            .is_some_and(|at| now - *at <= expiry)
    }

    /// Publish "stopped typing" for every open indicator without waiting.
    pub fn beacon_stop_all(&self) {
        let counterparts: Vec<String> = self.lock().local.drain().map(|(c, _)| c).collect();
        for counterpart in counterparts {
            self.remote
                .beacon(tables::TYPING_INDICATORS, self.row(&counterpart, false), ON_CONFLICT);
        }
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }

    async fn publish(&self, counterpart: &str, is_typing: bool) {
        tracing::debug!(counterpart, is_typing, "Publishing typing state");
        if let Err(e) = self
            .remote
            .upsert(
                tables::TYPING_INDICATORS,
                self.row(counterpart, is_typing),
                ON_CONFLICT,
            )
            .await
        {
            tracing::warn!("Failed to publish typing state: {}", e);
        }
    }

    fn row(&self, counterpart: &str, is_typing: bool) -> serde_json::Value {
        serde_json::json!({
            "user_id": self.self_id,
            "conversation_with": counterpart,
            "is_typing": is_typing,
            "updated_at": self.clock.now(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PostgresChangesPayload;
    use crate::infrastructure::ManualClock;
    use crate::messaging::ChangeKind;
    use crate::testing::{MockRemote, settle};
    use chrono::TimeZone;

    fn setup() -> (Arc<TypingTracker>, Arc<MockRemote>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let remote = MockRemote::new();
        let tracker = TypingTracker::new(
            "A",
            clock.clone(),
            remote.clone(),
            Duration::from_secs(3),
        );
        (tracker, remote, clock)
    }

    fn typing_flags(remote: &MockRemote) -> Vec<bool> {
        remote
            .upserts()
            .iter()
            .map(|(_, row, _)| row["is_typing"].as_bool().unwrap_or_default())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_debounce_into_start_and_stop() {
        let (tracker, remote, _) = setup();

        for _ in 0..3 {
            tracker.keystroke("B").await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(typing_flags(&remote), [true]);
        assert!(tracker.is_local_typing("B"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(typing_flags(&remote), [true, false]);
        assert!(!tracker.is_local_typing("B"));
        assert_eq!(remote.upserts()[0].2, ON_CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_typing_stays_visible_to_counterpart() {
        let (sender, sender_remote, clock) = setup();
        let receiver = TypingTracker::new(
            "B",
            clock.clone(),
            MockRemote::new(),
            Duration::from_secs(3),
        );
        let mut forwarded = 0;

        for step in 0..=10 {
            sender.keystroke("B").await;
            for (_, row, _) in sender_remote.upserts().iter().skip(forwarded) {
                let event: ChangeEvent =
                    PostgresChangesPayload::new("public", "typing_indicators", ChangeKind::Update)
                        .with_record(row.clone())
                        .into();
                receiver.record_change(&event);
                forwarded += 1;
            }
            assert!(receiver.is_typing("A"), "lapsed at step {step}");

            tokio::time::sleep(Duration::from_millis(500)).await;
            clock.advance(Duration::from_millis(500));
        }
        assert!(typing_flags(&sender_remote).iter().all(|typing| *typing));
        assert!(forwarded > 1);

        // Inactivity lets both sides lapse
        tokio::time::sleep(Duration::from_secs(3)).await;
        clock.advance(Duration::from_secs(3));
        assert!(!receiver.is_typing("A"));
        assert_eq!(typing_flags(&sender_remote).last(), Some(&false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_typing_clears_and_cancels_timer() {
        let (tracker, remote, _) = setup();

        tracker.keystroke("B").await;
        tracker.stop_typing("B").await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(typing_flags(&remote), [true, false]);
        tracker.stop_typing("B").await;
        assert_eq!(remote.upserts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_indicator_expires_at_read_time() {
        let (tracker, _, clock) = setup();
        let event: ChangeEvent =
            PostgresChangesPayload::new("public", "typing_indicators", ChangeKind::Insert)
                .with_record(serde_json::json!({
                    "user_id": "B",
                    "conversation_with": "A",
                    "is_typing": true,
                }))
                .into();

        tracker.record_change(&event);
        assert!(tracker.is_typing("B"));

        clock.advance(Duration::from_secs(4));
        assert!(!tracker.is_typing("B"));
        settle().await;
    }

    #[test]
    fn test_indicators_for_other_conversations_are_ignored() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tracker = TypingTracker::new("A", clock, MockRemote::new(), Duration::from_secs(3));
        let event: ChangeEvent =
            PostgresChangesPayload::new("public", "typing_indicators", ChangeKind::Insert)
                .with_record(serde_json::json!({
                    "user_id": "B",
                    "conversation_with": "C",
                    "is_typing": true,
                }))
                .into();

        tracker.record_change(&event);
        assert!(!tracker.is_typing("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacon_stop_all_on_teardown() {
        let (tracker, remote, _) = setup();
        tracker.keystroke("B").await;
        tracker.keystroke("C").await;

        tracker.beacon_stop_all();

        let beacons = remote.beacons();
        assert_eq!(beacons.len(), 2);
        assert!(beacons.iter().all(|(_, row)| row["is_typing"] == false));
        assert!(!tracker.is_local_typing("B"));
    }
}
