// Module declarations
mod core;
mod descriptor;
mod postgres_changes;
mod state;

// Public API exports
pub use self::core::{ChannelMultiplexer, Connectivity, MultiplexerOptions, Subscription};
pub use descriptor::{ChannelKey, KnownTables, ParticipantFilter, SubscriptionDescriptor, TableFilter};
pub use postgres_changes::{ColumnInfo, PostgresChangesMessage, PostgresChangesPayload};
pub use state::{ChannelHandle, HandleStatus, SubscriberCallback, SubscriberId};
