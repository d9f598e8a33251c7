//! # Chat Realtime
//!
//! Client-side coordinator for the chat layer of a Supabase-backed app:
//! shared realtime channels, change routing with coalesced cache
//! invalidation, an offline outbox with optimistic sends, and presence and
//! typing indicators.
//!
//! ## Example
//!
//! ```no_run
//! use chat_realtime_rs::{
//!     CoordinatorBuilder, CoordinatorOptions, FileStore, SubscriptionDescriptor, SupabaseOptions,
//!     SupabaseService, TableFilter,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = Arc::new(SupabaseService::new(SupabaseOptions::from_env()?)?);
//!     let store = Arc::new(FileStore::open(".chat-cache")?);
//!     let coordinator =
//!         CoordinatorBuilder::new(remote, store, CoordinatorOptions::for_user("user-a"))?.build();
//!
//!     coordinator.on_invalidate(|key| println!("refetch {key}"));
//!     coordinator.start().await?;
//!
//!     let _posts = coordinator
//!         .subscribe(
//!             SubscriptionDescriptor::new("feed").table(TableFilter::new("posts")),
//!             "feed-screen",
//!             |event| {
//!                 println!("{event:?}");
//!                 Ok(())
//!             },
//!         )
//!         .await?;
//!
//!     coordinator.send("user-b", "hi", None).await?;
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod infrastructure;
pub mod messaging;
pub mod outbox;
pub mod presence;
pub mod remote;
pub mod supabase;
pub mod types;

#[cfg(test)]
mod testing;

pub use channel::{
    ChannelKey, ChannelMultiplexer, Connectivity, HandleStatus, ParticipantFilter, SubscriberId,
    Subscription, SubscriptionDescriptor, TableFilter,
};
pub use client::{ChatCoordinator, CoordinatorBuilder, CoordinatorOptions};
pub use messaging::{ChangeEvent, ChangeKind, EventKind, InvalidationMap, SubscriberEvent};
pub use outbox::{FileStore, FlushOutcome, LocalStore, MemoryStore, OutboxOptions};
pub use presence::{PresenceOptions, Visibility};
pub use remote::{Notifier, RemoteService, TracingNotifier, TransportEvent};
pub use supabase::{SupabaseOptions, SupabaseService};
pub use types::{
    Attachment, ChatMessage, DeliveryState, MessageId, PendingMessage, PresenceState,
    RealtimeError, Result,
};
