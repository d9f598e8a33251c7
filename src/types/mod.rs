pub mod constants;
pub mod error;
pub mod message;

pub use constants::*;
pub use error::{CallbackError, RealtimeError, Result, StorageError};
pub use message::{
    Attachment, ChatMessage, DeliveryState, MessageId, PendingMessage, PresenceState, SendPayload,
};
