use crate::messaging::{ChangeEvent, EventKind};
use crate::types::{
    DEFAULT_SCHEMA, RECIPIENT_COLUMN, RealtimeError, Result, SENDER_COLUMN, tables,
};
use std::collections::HashSet;

/// One (schema, table, event-kind) interest, optionally narrowed by a
/// server-side row filter such as `recipient_id=eq.42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableFilter {
    pub schema: String,
    pub table: String,
    pub event: EventKind,
    pub row_filter: Option<String>,
}

impl TableFilter {
    /// All events on `public.<table>`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            event: EventKind::All,
            row_filter: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    pub fn row_filter(mut self, filter: impl Into<String>) -> Self {
        self.row_filter = Some(filter.into());
        self
    }

    /// Client-side check. The row filter is enforced by the server, except
    /// for the simple `column=eq.value` form which is re-checked here.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.schema != event.schema || self.table != event.table {
            return false;
        }
        if !self.event.matches(event.kind) {
            return false;
        }
        match self.row_filter.as_deref().and_then(parse_eq_filter) {
            Some((column, value)) => event.identity(column).as_deref() == Some(value),
            None => true,
        }
    }
}

fn parse_eq_filter(filter: &str) -> Option<(&str, &str)> {
    let (column, rest) = filter.split_once('=')?;
    let value = rest.strip_prefix("eq.")?;
    Some((column, value))
}

/// Restricts a subscription to the rows exchanged between identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantFilter {
    /// Rows between exactly these two identities, in either direction
    Pair(String, String),
    /// Rows where this identity is the sender or the recipient
    Involving(String),
}

impl ParticipantFilter {
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self::Pair(a.into(), b.into())
    }

    pub fn involving(identity: impl Into<String>) -> Self {
        Self::Involving(identity.into())
    }

    fn matches(&self, sender: Option<&str>, recipient: Option<&str>) -> bool {
        match self {
            Self::Pair(a, b) => match (sender, recipient) {
                (Some(s), Some(r)) => (s == a && r == b) || (s == b && r == a),
                _ => false,
            },
            Self::Involving(id) => sender == Some(id.as_str()) || recipient == Some(id.as_str()),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Self::Pair(a, b) => a.trim().is_empty() || b.trim().is_empty(),
            Self::Involving(id) => id.trim().is_empty(),
        }
    }
}

/// A subscriber's declared interest: topic, table filters, optional participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    pub topic: String,
    pub filters: Vec<TableFilter>,
    pub participants: Option<ParticipantFilter>,
    pub sender_column: String,
    pub recipient_column: String,
}

impl SubscriptionDescriptor {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            filters: Vec::new(),
            participants: None,
            sender_column: SENDER_COLUMN.to_string(),
            recipient_column: RECIPIENT_COLUMN.to_string(),
        }
    }

    pub fn table(mut self, filter: TableFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn participants(mut self, participants: ParticipantFilter) -> Self {
        self.participants = Some(participants);
        self
    }

    /// Overrides the identity columns used by the participant filter.
    pub fn identity_columns(
        mut self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        self.sender_column = sender.into();
        self.recipient_column = recipient.into();
        self
    }

    /// Key of the channel this descriptor is multiplexed onto.
    ///
    /// Participant filters are applied client-side and are not part of the key,
    /// so descriptors differing only by participants share a channel.
    pub fn key(&self) -> ChannelKey {
        let mut filters = self.filters.clone();
        filters.sort();
        filters.dedup();
        ChannelKey {
            topic: self.topic.clone(),
            filters,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.filters.iter().any(|f| f.matches(event)) {
            return false;
        }
        match &self.participants {
            Some(participants) => {
                let sender = event.identity(&self.sender_column);
                let recipient = event.identity(&self.recipient_column);
                participants.matches(sender.as_deref(), recipient.as_deref())
            }
            None => true,
        }
    }

    pub fn validate(&self, known: &KnownTables) -> Result<()> {
        let topic = self.topic.trim();
        if topic.is_empty() {
            return Err(RealtimeError::InvalidDescriptor(
                "topic is empty".to_string(),
            ));
        }
        if !topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        {
            return Err(RealtimeError::InvalidDescriptor(format!(
                "topic '{}' contains unsupported characters",
                self.topic
            )));
        }
        if self.filters.is_empty() {
            return Err(RealtimeError::InvalidDescriptor(format!(
                "topic '{}' has no table filters",
                self.topic
            )));
        }
        for filter in &self.filters {
            if !known.contains(&filter.schema, &filter.table) {
                return Err(RealtimeError::InvalidDescriptor(format!(
                    "unknown table {}.{}",
                    filter.schema, filter.table
                )));
            }
            if let Some(row_filter) = &filter.row_filter
                && !row_filter.contains('=')
            {
                return Err(RealtimeError::InvalidDescriptor(format!(
                    "row filter '{}' is not of the form column=op.value",
                    row_filter
                )));
            }
        }
        if let Some(participants) = &self.participants
            && participants.is_blank()
        {
            return Err(RealtimeError::InvalidDescriptor(
                "participant filter has an empty identity".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity of one underlying channel: topic plus the normalized filter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    topic: String,
    filters: Vec<TableFilter>,
}

impl ChannelKey {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn filters(&self) -> &[TableFilter] {
        &self.filters
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.topic)?;
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}.{}:{}", filter.schema, filter.table, filter.event.as_str())?;
            if let Some(row_filter) = &filter.row_filter {
                write!(f, "?{}", row_filter)?;
            }
        }
        f.write_str("]")
    }
}

/// Tables a descriptor may reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownTables(HashSet<(String, String)>);

impl KnownTables {
    pub fn empty() -> Self {
        Self(HashSet::new())
    }

    pub fn with(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.0.insert((schema.into(), table.into()));
        self
    }

    pub fn contains(&self, schema: &str, table: &str) -> bool {
        self.0.contains(&(schema.to_string(), table.to_string()))
    }
}

impl Default for KnownTables {
    fn default() -> Self {
        [
            tables::MESSAGES,
            tables::POSTS,
            tables::POST_COMMENTS,
            tables::POST_LIKES,
            tables::NOTIFICATIONS,
            tables::USER_PRESENCE,
            tables::TYPING_INDICATORS,
            tables::TRANSACTIONS,
            tables::INVOICES,
            tables::PAYMENTS,
            tables::GOALS,
        ]
        .into_iter()
        .fold(Self::empty(), |known, table| known.with(DEFAULT_SCHEMA, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PostgresChangesPayload;
    use crate::messaging::ChangeKind;

    fn message_event(sender: &str, recipient: &str) -> ChangeEvent {
        PostgresChangesPayload::new("public", "messages", ChangeKind::Insert)
            .with_record(serde_json::json!({
                "id": "m1",
                "sender_id": sender,
                "recipient_id": recipient,
            }))
            .into()
    }

    #[test]
    fn test_key_ignores_filter_order_and_participants() {
        let a = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages"))
            .table(TableFilter::new("typing_indicators"))
            .participants(ParticipantFilter::pair("alice", "bob"));
        let b = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("typing_indicators"))
            .table(TableFilter::new("messages"))
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::pair("alice", "carol"));

        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().filters().len(), 2);
    }

    #[test]
    fn test_key_distinguishes_row_filters_and_events() {
        let base = SubscriptionDescriptor::new("chat").table(TableFilter::new("messages"));
        let filtered = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages").row_filter("recipient_id=eq.alice"));
        let inserts = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages").event(EventKind::Insert));

        assert_ne!(base.key(), filtered.key());
        assert_ne!(base.key(), inserts.key());
    }

    #[test]
    fn test_pair_filter_is_symmetric_and_exclusive() {
        let ab = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::pair("A", "B"));
        let ac = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::pair("A", "C"));

        let b_to_a = message_event("B", "A");
        assert!(ab.matches(&b_to_a));
        assert!(!ac.matches(&b_to_a));
        assert!(ab.matches(&message_event("A", "B")));
    }

    #[test]
    fn test_involving_filter_matches_either_side() {
        let mine = SubscriptionDescriptor::new("inbox")
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::involving("A"));

        assert!(mine.matches(&message_event("A", "Z")));
        assert!(mine.matches(&message_event("Z", "A")));
        assert!(!mine.matches(&message_event("B", "C")));
    }

    #[test]
    fn test_eq_row_filter_rechecked_client_side() {
        let descriptor = SubscriptionDescriptor::new("inbox")
            .table(TableFilter::new("messages").row_filter("recipient_id=eq.A"));

        assert!(descriptor.matches(&message_event("B", "A")));
        assert!(!descriptor.matches(&message_event("A", "B")));
    }

    #[test]
    fn test_table_and_event_mismatch() {
        let inserts_only = SubscriptionDescriptor::new("feed")
            .table(TableFilter::new("posts").event(EventKind::Insert));
        assert!(!inserts_only.matches(&message_event("A", "B")));

        let updates = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages").event(EventKind::Update));
        assert!(!updates.matches(&message_event("A", "B")));
    }

    #[test]
    fn test_validation_rejects_malformed_descriptors() {
        let known = KnownTables::default();

        let no_filters = SubscriptionDescriptor::new("chat");
        assert!(matches!(
            no_filters.validate(&known),
            Err(RealtimeError::InvalidDescriptor(_))
        ));

        let unknown = SubscriptionDescriptor::new("chat").table(TableFilter::new("ledger_rows"));
        assert!(unknown.validate(&known).is_err());

        let blank_topic = SubscriptionDescriptor::new("  ").table(TableFilter::new("messages"));
        assert!(blank_topic.validate(&known).is_err());

        let bad_topic = SubscriptionDescriptor::new("chat room").table(TableFilter::new("messages"));
        assert!(bad_topic.validate(&known).is_err());

        let blank_participant = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::pair("A", ""));
        assert!(blank_participant.validate(&known).is_err());

        let bad_row_filter = SubscriptionDescriptor::new("chat")
            .table(TableFilter::new("messages").row_filter("recipient_id"));
        assert!(bad_row_filter.validate(&known).is_err());

        let ok = SubscriptionDescriptor::new("chat:inbox")
            .table(TableFilter::new("messages"))
            .participants(ParticipantFilter::involving("A"));
        assert!(ok.validate(&known).is_ok());
    }
}
