use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::constants::TEMP_ID_PREFIX;
use super::error::{RealtimeError, Result};

/// Identifier of a chat message.
///
/// Ids minted locally for optimistic sends carry the `temp_` prefix and are
/// superseded by the server-assigned id once the insert is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn server(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn temporary(created_at: DateTime<Utc>, seq: u64) -> Self {
        Self(format!(
            "{}{}-{}",
            TEMP_ID_PREFIX,
            created_at.timestamp_millis(),
            seq
        ))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A message as shown in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryState,
}

impl ChatMessage {
    /// The other side of the conversation, seen from `self_id`.
    pub fn counterparty<'a>(&'a self, self_id: &str) -> &'a str {
        if self.sender_id == self_id {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }

    /// Parses a `messages` row as returned by PostgREST or a change feed.
    pub fn from_row(row: Value) -> Result<Self> {
        let row: MessageRow = serde_json::from_value(row)?;
        Ok(row.into())
    }
}

/// Column layout of the `messages` table.
#[derive(Debug, Deserialize)]
struct MessageRow {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    sender_id: String,
    recipient_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachment_url: Option<String>,
    #[serde(default)]
    attachment_name: Option<String>,
    #[serde(default)]
    attachment_type: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    status: Option<DeliveryState>,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        let status = match (row.read_at, row.status) {
            (Some(_), _) => DeliveryState::Read,
            (None, Some(status)) => status,
            (None, None) => DeliveryState::Sent,
        };
        Self {
            id: MessageId::server(row.id),
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            content: row.content,
            attachment: row.attachment_url.map(|url| Attachment {
                url,
                name: row.attachment_name,
                mime_type: row.attachment_type,
            }),
            created_at: row.created_at,
            status,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// What a collaborator hands to `send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPayload {
    pub recipient_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl SendPayload {
    pub fn new(recipient_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            content: content.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.recipient_id.trim().is_empty() {
            return Err(RealtimeError::InvalidMessage(
                "recipient id is empty".to_string(),
            ));
        }
        if self.content.trim().is_empty() && self.attachment.is_none() {
            return Err(RealtimeError::InvalidMessage(
                "message has neither content nor attachment".to_string(),
            ));
        }
        Ok(())
    }

    /// Row inserted into the `messages` table.
    pub(crate) fn to_row(&self, sender_id: &str, created_at: DateTime<Utc>) -> Value {
        let mut row = serde_json::json!({
            "sender_id": sender_id,
            "recipient_id": self.recipient_id,
            "content": self.content,
            "created_at": created_at,
        });
        if let (Some(attachment), Some(map)) = (&self.attachment, row.as_object_mut()) {
            map.insert("attachment_url".into(), attachment.url.clone().into());
            if let Some(name) = &attachment.name {
                map.insert("attachment_name".into(), name.clone().into());
            }
            if let Some(mime_type) = &attachment.mime_type {
                map.insert("attachment_type".into(), mime_type.clone().into());
            }
        }
        row
    }
}

/// Outbox entry for a message that has not been acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: MessageId,
    pub sender_id: String,
    pub payload: SendPayload,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingMessage {
    /// The optimistic copy shown in the conversation until the server id arrives.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.payload.recipient_id.clone(),
            content: self.payload.content.clone(),
            attachment: self.payload.attachment.clone(),
            created_at: self.created_at,
            status: self.state,
        }
    }

    /// Whether a server row is the echo of this entry.
    pub(crate) fn is_echoed_by(&self, message: &ChatMessage) -> bool {
        message.sender_id == self.sender_id
            && message.recipient_id == self.payload.recipient_id
            && message.content == self.payload.content
            && message.attachment == self.payload.attachment
    }
}

/// Presence status derived at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Away,
    #[default]
    Offline,
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}
