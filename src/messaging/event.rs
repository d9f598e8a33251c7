use crate::channel::PostgresChangesPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A table row as delivered by the change feed.
pub type Row = serde_json::Map<String, Value>;

/// Operation that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Operations a table filter listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    #[default]
    #[serde(rename = "*")]
    All,
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Insert => kind == ChangeKind::Insert,
            Self::Update => kind == ChangeKind::Update,
            Self::Delete => kind == ChangeKind::Delete,
        }
    }
}

impl From<ChangeKind> for EventKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => Self::Insert,
            ChangeKind::Update => Self::Update,
            ChangeKind::Delete => Self::Delete,
        }
    }
}

/// Normalized change notification handed to subscribers.
///
/// Every transport payload is converted into this shape at the router
/// boundary, so nothing past the router sees the wire schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub new_value: Option<Row>,
    pub old_value: Option<Row>,
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    /// The row describing the affected record: the new image, or the old one for deletes.
    pub fn row(&self) -> Option<&Row> {
        self.new_value.as_ref().or(self.old_value.as_ref())
    }

    /// String form of an identity-like column (strings as-is, numbers formatted).
    pub fn identity(&self, column: &str) -> Option<String> {
        match self.row()?.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The affected row as a JSON object value.
    pub fn row_value(&self) -> Option<Value> {
        self.row().cloned().map(Value::Object)
    }
}

impl From<PostgresChangesPayload> for ChangeEvent {
    fn from(payload: PostgresChangesPayload) -> Self {
        // Empty images are how the server says "not applicable"
        let non_empty = |row: Option<Row>| row.filter(|r| !r.is_empty());
        Self {
            kind: payload.kind,
            schema: payload.schema,
            table: payload.table,
            new_value: non_empty(payload.record),
            old_value: non_empty(payload.old_record),
            commit_timestamp: payload.commit_timestamp,
        }
    }
}

/// What a subscriber callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// A change matching the subscriber's descriptor
    Change(ChangeEvent),
    /// The underlying channel exhausted its reconnection budget
    ChannelFailed { channel: String, reason: String },
}
