// Supabase backend - realtime socket plus PostgREST
mod connection;
mod heartbeat;
mod options;
mod protocol;
mod rest;
mod service;

pub use connection::{ConnectionState, SocketConnection};
pub use heartbeat::SocketHeartbeat;
pub use options::SupabaseOptions;
pub use protocol::{
    BroadcastConfig, ChannelJoinConfig, JoinPayload, PhoenixMessage, PostgresChangesConfig,
    PresenceConfig, Reply, SystemPayload,
};
pub use rest::RestClient;
pub use service::SupabaseService;
