use crate::types::{ChatMessage, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Locally cached, ordered message list for one counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub counterparty: String,
    pub messages: Vec<ChatMessage>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationSnapshot {
    pub fn new(counterparty: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            counterparty: counterparty.into(),
            messages: Vec::new(),
            last_activity: at,
        }
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn append(&mut self, message: ChatMessage, at: DateTime<Utc>) {
        self.messages.push(message);
        self.touch(at);
    }

    /// Insert keeping `created_at` order; ties go after existing messages.
    pub fn insert_sorted(&mut self, message: ChatMessage, at: DateTime<Utc>) {
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
        self.touch(at);
    }

    /// Swap the message with id `old` for `message` at the same index.
    pub fn replace(&mut self, old: &MessageId, message: ChatMessage, at: DateTime<Utc>) -> bool {
        match self.position(old) {
            Some(index) => {
                self.messages[index] = message;
                self.touch(at);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<ChatMessage> {
        let index = self.position(id)?;
        Some(self.messages.remove(index))
    }

    /// Drop the oldest acknowledged messages until at most `max` remain.
    /// Optimistic (temporary) messages are never dropped.
    pub fn cap(&mut self, max: usize) -> usize {
        let mut dropped = 0;
        while self.messages.len() > max {
            match self.messages.iter().position(|m| !m.id.is_temporary()) {
                Some(index) => {
                    self.messages.remove(index);
                    dropped += 1;
                }
                None => break,
            }
        }
        dropped
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }
}

/// All cached conversations, keyed by counterparty.
#[derive(Debug, Default)]
pub(crate) struct ConversationCache {
    conversations: HashMap<String, ConversationSnapshot>,
}

impl ConversationCache {
    pub fn get(&self, counterparty: &str) -> Option<&ConversationSnapshot> {
        self.conversations.get(counterparty)
    }

    pub fn get_mut(&mut self, counterparty: &str) -> Option<&mut ConversationSnapshot> {
        self.conversations.get_mut(counterparty)
    }

    pub fn entry(&mut self, counterparty: &str, at: DateTime<Utc>) -> &mut ConversationSnapshot {
        self.conversations
            .entry(counterparty.to_string())
            .or_insert_with(|| ConversationSnapshot::new(counterparty, at))
    }

    pub fn insert(&mut self, snapshot: ConversationSnapshot) {
        self.conversations
            .insert(snapshot.counterparty.clone(), snapshot);
    }

    pub fn remove(&mut self, counterparty: &str) -> Option<ConversationSnapshot> {
        self.conversations.remove(counterparty)
    }

    /// Sorted so the persisted index is stable.
    pub fn counterparties(&self) -> Vec<String> {
        let mut names: Vec<String> = self.conversations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Conversation holding a message with this id, if any.
    pub fn find(&self, id: &MessageId) -> Option<&str> {
        self.conversations
            .values()
            .find(|c| c.contains(id))
            .map(|c| c.counterparty.as_str())
    }

    /// Least recently active conversation outside `protected`.
    pub fn least_recent(&self, protected: &HashSet<String>) -> Option<String> {
        self.conversations
            .values()
            .filter(|c| !protected.contains(&c.counterparty))
            .min_by_key(|c| c.last_activity)
            .map(|c| c.counterparty.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryState;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    fn message(id: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId::server(id),
            sender_id: "A".into(),
            recipient_id: "B".into(),
            content: id.into(),
            attachment: None,
            created_at: at(secs),
            status: DeliveryState::Sent,
        }
    }

    #[test]
    fn test_insert_sorted_keeps_chronological_order() {
        let mut conversation = ConversationSnapshot::new("B", at(0));
        conversation.append(message("m1", 10), at(10));
        conversation.append(message("m3", 30), at(30));
        conversation.insert_sorted(message("m2", 20), at(40));

        let ids: Vec<&str> = conversation.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert_eq!(conversation.last_activity, at(40));
    }

    #[test]
    fn test_replace_preserves_index() {
        let mut conversation = ConversationSnapshot::new("B", at(0));
        conversation.append(message("m1", 1), at(1));
        conversation.append(message("temp_1-1", 2), at(2));
        conversation.append(message("m3", 3), at(3));

        assert!(conversation.replace(&MessageId::server("temp_1-1"), message("srv_9", 2), at(4)));
        assert_eq!(conversation.position(&MessageId::server("srv_9")), Some(1));
        assert_eq!(conversation.messages.len(), 3);
        assert!(!conversation.replace(&MessageId::server("nope"), message("x", 5), at(5)));
    }

    #[test]
    fn test_cap_never_drops_optimistic_messages() {
        let mut conversation = ConversationSnapshot::new("B", at(0));
        conversation.append(message("temp_1-1", 1), at(1));
        conversation.append(message("m2", 2), at(2));
        conversation.append(message("temp_3-2", 3), at(3));
        conversation.append(message("m4", 4), at(4));

        assert_eq!(conversation.cap(2), 2);
        let ids: Vec<&str> = conversation.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["temp_1-1", "temp_3-2"]);

        assert_eq!(conversation.cap(1), 0);
        assert_eq!(conversation.messages.len(), 2);
    }

    #[test]
    fn test_least_recent_skips_protected() {
        let mut cache = ConversationCache::default();
        cache.entry("B", at(10));
        cache.entry("C", at(5));
        cache.entry("D", at(20));

        let protected: HashSet<String> = ["C".to_string()].into();
        assert_eq!(cache.least_recent(&protected).as_deref(), Some("B"));
        assert_eq!(cache.least_recent(&HashSet::new()).as_deref(), Some("C"));
    }
}
