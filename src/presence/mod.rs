// Presence module - online status, heartbeats and typing indicators
mod heartbeat;
mod tracker;
mod typing;

pub use heartbeat::PresenceHeartbeat;
pub(crate) use heartbeat::PRESENCE_CONFLICT_COLUMN;
pub use tracker::{PresenceOptions, PresenceRecord, PresenceRow, PresenceTracker, Visibility};
pub use typing::TypingTracker;
