//! Phoenix channel frames as spoken by the Supabase realtime server.
//! Reference: https://supabase.com/docs/guides/realtime/protocol

use crate::channel::TableFilter;
use crate::types::{PHOENIX_TOPIC, phoenix_events};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame on the socket, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            r#ref: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, r#ref: impl Into<String>) -> Self {
        self.r#ref = Some(r#ref.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    pub fn heartbeat(r#ref: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, phoenix_events::HEARTBEAT, Value::Object(Default::default()))
            .with_ref(r#ref)
    }

    /// `phx_join` whose ref doubles as the join ref.
    pub fn join(topic: impl Into<String>, payload: &JoinPayload, r#ref: String) -> serde_json::Result<Self> {
        Ok(Self::new(topic, phoenix_events::JOIN, serde_json::to_value(payload)?)
            .with_ref(r#ref.clone())
            .with_join_ref(r#ref))
    }

    pub fn leave(topic: impl Into<String>, r#ref: String) -> Self {
        Self::new(topic, phoenix_events::LEAVE, Value::Object(Default::default())).with_ref(r#ref)
    }

    /// Status of a `phx_reply`, `None` for any other event.
    pub fn reply(&self) -> Option<Reply> {
        if self.event != phoenix_events::REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn is_heartbeat_reply(&self) -> bool {
        self.topic == PHOENIX_TOPIC && self.event == phoenix_events::REPLY
    }
}

/// Payload of a `phx_reply`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Reply {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Server-provided reason for a non-ok reply.
    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("join rejected ({})", self.status))
    }
}

/// Payload of a `system` frame, sent once postgres changes are wired up
/// or failed to be.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SystemPayload {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BroadcastConfig {
    /// Receive our own broadcasts
    #[serde(rename = "self")]
    pub self_: bool,
    pub ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresenceConfig {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresChangesConfig {
    pub event: String, // "*" | "INSERT" | "UPDATE" | "DELETE"
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl From<&TableFilter> for PostgresChangesConfig {
    fn from(filter: &TableFilter) -> Self {
        Self {
            event: filter.event.as_str().to_string(),
            schema: filter.schema.clone(),
            table: filter.table.clone(),
            filter: filter.row_filter.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelJoinConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    #[serde(rename = "private")]
    pub is_private: bool,
    pub postgres_changes: Vec<PostgresChangesConfig>,
}

/// Full join payload sent to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: ChannelJoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl JoinPayload {
    pub fn postgres_changes(filters: &[TableFilter], access_token: Option<String>) -> Self {
        Self {
            config: ChannelJoinConfig {
                postgres_changes: filters.iter().map(PostgresChangesConfig::from).collect(),
                ..Default::default()
            },
            access_token,
        }
    }
}
