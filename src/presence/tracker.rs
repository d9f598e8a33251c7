use crate::infrastructure::Clock;
use crate::messaging::ChangeEvent;
use crate::types::{
    PRESENCE_HEARTBEAT_INTERVAL, PRESENCE_STALE_AFTER, PresenceState, TYPING_EXPIRY,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Tuning for presence and typing.
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    /// A user not seen for longer than this reads as offline
    pub staleness_window: Duration,
    pub heartbeat_interval: Duration,
    /// Idle time after the last keystroke before "stopped typing"
    pub typing_expiry: Duration,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_millis(PRESENCE_STALE_AFTER),
            heartbeat_interval: Duration::from_millis(PRESENCE_HEARTBEAT_INTERVAL),
            typing_expiry: Duration::from_millis(TYPING_EXPIRY),
        }
    }
}

/// Whether the app is on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

impl Visibility {
    pub fn presence(self) -> PresenceState {
        match self {
            Self::Foreground => PresenceState::Online,
            Self::Background => PresenceState::Away,
        }
    }
}

/// Last known presence of one user.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub status: PresenceState,
    pub last_seen: DateTime<Utc>,
    /// Conversation the user has open, if they share it
    pub viewing: Option<String>,
}

/// Column layout of the `user_presence` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRow {
    pub user_id: String,
    pub status: PresenceState,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub viewing_conversation: Option<String>,
}

#[derive(Debug)]
struct LocalPresence {
    status: PresenceState,
    viewing: Option<String>,
}

/// Presence of every user this client has heard about, including itself.
pub struct PresenceTracker {
    self_id: String,
    clock: Arc<dyn Clock>,
    staleness_window: chrono::Duration,
    records: Mutex<HashMap<String, PresenceRecord>>,
    local: Mutex<LocalPresence>,
}

impl PresenceTracker {
    pub fn new(self_id: impl Into<String>, clock: Arc<dyn Clock>, staleness_window: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            clock,
            staleness_window: chrono::Duration::from_std(staleness_window)
                .unwrap_or(chrono::Duration::MAX),
            records: Mutex::new(HashMap::new()),
            local: Mutex::new(LocalPresence {
                status: PresenceState::Offline,
                viewing: None,
            }),
        }
    }

    /// Store a record unless a newer one is already known.
    pub fn record(&self, user_id: &str, record: PresenceRecord) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get(user_id) {
            Some(existing) if existing.last_seen > record.last_seen => false,
            _ => {
                records.insert(user_id.to_string(), record);
                true
            }
        }
    }

    /// Apply a change on the `user_presence` table.
    pub fn record_change(&self, event: &ChangeEvent) -> bool {
        let Some(row) = event.row_value() else {
            return false;
        };
        match serde_json::from_value::<PresenceRow>(row) {
            Ok(row) => self.record(
                &row.user_id,
                PresenceRecord {
                    status: row.status,
                    last_seen: row.last_seen,
                    viewing: row.viewing_conversation,
                },
            ),
            Err(e) => {
                tracing::debug!("Ignoring malformed presence row: {}", e);
                false
            }
        }
    }

    /// Current status, downgraded to `Offline` once the record is stale.
    pub fn get_status(&self, user_id: &str) -> PresenceState {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get(user_id) {
            Some(record) if self.clock.now() - record.last_seen <= self.staleness_window => {
                record.status
            }
            _ => PresenceState::Offline,
        }
    }

    pub fn get_record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    /// Record our own status now and return the row to publish.
    pub fn local_update(&self, status: PresenceState) -> PresenceRow {
        let now = self.clock.now();
        let viewing = {
            let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
            local.status = status;
            local.viewing.clone()
        };
        self.record(
            &self.self_id,
            PresenceRecord {
                status,
                last_seen: now,
                viewing: viewing.clone(),
            },
        );
        PresenceRow {
            user_id: self.self_id.clone(),
            status,
            last_seen: now,
            viewing_conversation: viewing,
        }
    }

    pub fn local_status(&self) -> PresenceState {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn set_viewing(&self, counterparty: Option<String>) {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .viewing = counterparty;
    }

    /// Whether we have the conversation with `counterparty` open on screen.
    pub fn is_viewing(&self, counterparty: &str) -> bool {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        local.status == PresenceState::Online && local.viewing.as_deref() == Some(counterparty)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PostgresChangesPayload;
    use crate::infrastructure::ManualClock;
    use crate::messaging::ChangeKind;
    use chrono::TimeZone;

    fn setup() -> (PresenceTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let tracker = PresenceTracker::new("A", clock.clone(), Duration::from_secs(120));
        (tracker, clock)
    }

    #[test]
    fn test_stale_presence_reads_offline() {
        let (tracker, clock) = setup();
        tracker.record(
            "B",
            PresenceRecord {
                status: PresenceState::Online,
                last_seen: clock.now(),
                viewing: None,
            },
        );
        assert_eq!(tracker.get_status("B"), PresenceState::Online);

        clock.advance(Duration::from_secs(120));
        assert_eq!(tracker.get_status("B"), PresenceState::Online);

        clock.advance(Duration::from_secs(1));
        assert_eq!(tracker.get_status("B"), PresenceState::Offline);
        // The stored status is untouched
        assert_eq!(tracker.get_record("B").unwrap().status, PresenceState::Online);
    }

    #[test]
    fn test_unknown_user_is_offline() {
        let (tracker, _) = setup();
        assert_eq!(tracker.get_status("nobody"), PresenceState::Offline);
    }

    #[test]
    fn test_older_rows_do_not_override_newer() {
        let (tracker, clock) = setup();
        let now = clock.now();
        tracker.record(
            "B",
            PresenceRecord {
                status: PresenceState::Away,
                last_seen: now,
                viewing: None,
            },
        );

        let older = PresenceRecord {
            status: PresenceState::Online,
            last_seen: now - chrono::Duration::seconds(30),
            viewing: None,
        };
        assert!(!tracker.record("B", older));
        assert_eq!(tracker.get_status("B"), PresenceState::Away);
    }

    #[test]
    fn test_presence_row_from_change_feed() {
        let (tracker, _) = setup();
        let event: ChangeEvent =
            PostgresChangesPayload::new("public", "user_presence", ChangeKind::Update)
                .with_record(serde_json::json!({
                    "user_id": "B",
                    "status": "online",
                    "last_seen": "2025-06-01T11:59:30Z",
                    "viewing_conversation": "A",
                }))
                .into();

        assert!(tracker.record_change(&event));
        assert_eq!(tracker.get_status("B"), PresenceState::Online);
        assert_eq!(tracker.get_record("B").unwrap().viewing.as_deref(), Some("A"));
    }

    #[test]
    fn test_local_update_tracks_self() {
        let (tracker, _) = setup();
        tracker.set_viewing(Some("B".to_string()));

        let row = tracker.local_update(PresenceState::Online);

        assert_eq!(row.user_id, "A");
        assert_eq!(row.viewing_conversation.as_deref(), Some("B"));
        assert_eq!(tracker.get_status("A"), PresenceState::Online);
        assert!(tracker.is_viewing("B"));

        tracker.local_update(Visibility::Background.presence());
        assert!(!tracker.is_viewing("B"));
    }
}
