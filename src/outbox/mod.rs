// Offline outbox - durable send queue and cached conversations
mod core;
mod snapshot;
mod storage;

pub use self::core::{FlushOutcome, Outbox, OutboxOptions, RemoteApply};
pub use snapshot::ConversationSnapshot;
pub use storage::{FileStore, LocalStore, MemoryStore};
