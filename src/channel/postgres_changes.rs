use crate::messaging::{ChangeKind, Row};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// A `postgres_changes` record exactly as the realtime server sends it.
///
/// The server calls the new image `record` and the previous one `old_record`;
/// both are present but empty when not applicable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PostgresChangesPayload {
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    #[serde(default)]
    pub record: Option<Row>,
    #[serde(default)]
    pub old_record: Option<Row>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

impl PostgresChangesPayload {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind,
            commit_timestamp: None,
            record: None,
            old_record: None,
            columns: Vec::new(),
            errors: None,
        }
    }

    pub fn with_record(mut self, record: serde_json::Value) -> Self {
        self.record = record.as_object().cloned();
        self
    }

    pub fn with_old_record(mut self, record: serde_json::Value) -> Self {
        self.old_record = record.as_object().cloned();
        self
    }
}

/// Envelope of a `postgres_changes` frame: matching subscription ids plus the record.
#[derive(Deserialize, Debug, Clone)]
pub struct PostgresChangesMessage {
    #[serde(default)]
    pub ids: Vec<u64>,
    pub data: PostgresChangesPayload,
}
