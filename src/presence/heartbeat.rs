use super::tracker::PresenceTracker;
use crate::remote::RemoteService;
use crate::types::{PresenceState, tables};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

pub(crate) const PRESENCE_CONFLICT_COLUMN: &str = "user_id";

/// Publishes our presence on a fixed interval while the session is active.
pub struct PresenceHeartbeat {
    interval: Duration,
    tracker: Weak<PresenceTracker>,
    remote: Arc<dyn RemoteService>,
}

impl PresenceHeartbeat {
    pub fn new(tracker: Weak<PresenceTracker>, remote: Arc<dyn RemoteService>) -> Self {
        Self {
            interval: Duration::from_millis(crate::types::PRESENCE_HEARTBEAT_INTERVAL),
            tracker,
            remote,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawns the heartbeat task. It ends when the tracker is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = time::interval(self.interval);
            interval_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                interval_timer.tick().await;

                let Some(tracker) = self.tracker.upgrade() else {
                    break;
                };

                // Offline means the session is not active
                let status = tracker.local_status();
                if status == PresenceState::Offline {
                    continue;
                }

                let row = tracker.local_update(status);
                drop(tracker);
                match serde_json::to_value(&row) {
                    Ok(row) => {
                        if let Err(e) = self
                            .remote
                            .upsert(tables::USER_PRESENCE, row, PRESENCE_CONFLICT_COLUMN)
                            .await
                        {
                            tracing::warn!("Presence heartbeat failed: {}", e);
                        } else {
                            tracing::debug!("Presence heartbeat sent ({})", status);
                        }
                    }
                    Err(e) => tracing::error!("Could not encode presence row: {}", e),
                }
            }
        })
    }
}
