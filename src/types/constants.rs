/// Phoenix protocol event strings (magic strings layer)
pub mod phoenix_events {
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const JOIN: &str = "phx_join";
    pub const REPLY: &str = "phx_reply";
    pub const LEAVE: &str = "phx_leave";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Phoenix protocol topics
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the realtime server expects on every channel topic
pub const REALTIME_TOPIC_PREFIX: &str = "realtime:";

/// Channel event strings sent by the realtime server
pub mod channel_events {
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";
}

/// Protocol version
pub const VSN: &str = "1.0.0";

/// Default timeout (milliseconds)
pub const DEFAULT_TIMEOUT: u64 = 10000;

/// Default socket heartbeat interval (milliseconds)
pub const HEARTBEAT_INTERVAL: u64 = 25000;

/// Reconnection backoff (milliseconds / attempts)
pub const RECONNECT_BASE_DELAY: u64 = 1000;
pub const RECONNECT_BACKOFF_FACTOR: u32 = 2;
pub const RECONNECT_MAX_DELAY: u64 = 30_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before a channel with no subscribers is closed (milliseconds)
pub const UNSUBSCRIBE_GRACE: u64 = 1000;

/// Invalidation coalescing window (milliseconds)
pub const COALESCE_WINDOW: u64 = 500;

/// Presence (milliseconds)
pub const PRESENCE_STALE_AFTER: u64 = 120_000;
pub const PRESENCE_HEARTBEAT_INTERVAL: u64 = 30_000;
pub const TYPING_EXPIRY: u64 = 3000;

/// Outbox delivery
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;
pub const OUTBOX_RETRY_DELAY: u64 = 5000;
pub const OUTBOX_MAX_RETRY_DELAY: u64 = 60_000;

/// Local cache limits
pub const MAX_MESSAGES_PER_CONVERSATION: usize = 200;
pub const STORAGE_BUDGET_BYTES: usize = 4 * 1024 * 1024;

/// Client-generated message ids start with this prefix; server ids never do
pub const TEMP_ID_PREFIX: &str = "temp_";

pub const DEFAULT_SCHEMA: &str = "public";

/// Columns identifying the two sides of a message-like row
pub const SENDER_COLUMN: &str = "sender_id";
pub const RECIPIENT_COLUMN: &str = "recipient_id";

/// Tables the application subscribes to
pub mod tables {
    pub const MESSAGES: &str = "messages";
    pub const POSTS: &str = "posts";
    pub const POST_COMMENTS: &str = "post_comments";
    pub const POST_LIKES: &str = "post_likes";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const USER_PRESENCE: &str = "user_presence";
    pub const TYPING_INDICATORS: &str = "typing_indicators";
    pub const TRANSACTIONS: &str = "transactions";
    pub const INVOICES: &str = "invoices";
    pub const PAYMENTS: &str = "payments";
    pub const GOALS: &str = "goals";
}

/// Remote procedures
pub mod rpc {
    pub const MARK_MESSAGES_READ: &str = "mark_messages_read";
}

/// Local persistence keys
pub mod storage_keys {
    pub const OUTBOX: &str = "chat:outbox";
    pub const CONVERSATION_INDEX: &str = "chat:conversations";
    pub const CONVERSATION_PREFIX: &str = "chat:conversation:";
}
