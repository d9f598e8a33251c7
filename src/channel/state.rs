use super::descriptor::{ChannelKey, SubscriptionDescriptor};
use crate::messaging::SubscriberEvent;
use crate::types::CallbackError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Lifecycle of one underlying realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Idle,
    Connecting,
    Subscribed,
    Errored,
    Closed,
    Reconnecting,
    /// Retry ceiling reached. Only a fresh subscribe or coming back online revives it.
    Failed,
}

impl HandleStatus {
    pub fn can_transition_to(self, next: HandleStatus) -> bool {
        use HandleStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Subscribed)
                | (Connecting, Errored)
                | (Connecting, Closed)
                | (Subscribed, Errored)
                | (Subscribed, Closed)
                | (Errored, Reconnecting)
                | (Closed, Reconnecting)
                | (Errored, Failed)
                | (Closed, Failed)
                | (Reconnecting, Connecting)
                | (Failed, Connecting)
        )
    }
}

/// Stable identity of a logical subscriber (a screen, a hook instance...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

pub type SubscriberCallback =
    Arc<dyn Fn(&SubscriberEvent) -> Result<(), CallbackError> + Send + Sync + 'static>;

/// One shared channel and the subscribers multiplexed onto it.
#[derive(Debug)]
pub struct ChannelHandle {
    pub name: String,
    pub key: ChannelKey,
    pub status: HandleStatus,
    pub subscribers: HashSet<SubscriberId>,
    pub retry_count: u32,
    /// Set on every (re)open from the registry-wide sequence; transport
    /// events from older opens, of this handle or an earlier one, are ignored
    pub epoch: u64,
    /// Bumped whenever a pending teardown must be cancelled
    pub teardown_generation: u64,
}

impl ChannelHandle {
    pub fn new(name: String, key: ChannelKey) -> Self {
        Self {
            name,
            key,
            status: HandleStatus::Idle,
            subscribers: HashSet::new(),
            retry_count: 0,
            epoch: 0,
            teardown_generation: 0,
        }
    }

    /// Apply a transition, logging (and refusing) invalid ones.
    pub fn transition(&mut self, next: HandleStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                channel = %self.name,
                "Ignoring invalid transition {:?} -> {:?}",
                self.status,
                next
            );
            return false;
        }
        tracing::debug!(channel = %self.name, "{:?} -> {:?}", self.status, next);
        self.status = next;
        true
    }
}

pub(crate) struct SubscriberEntry {
    pub descriptor: SubscriptionDescriptor,
    pub key: ChannelKey,
    pub callback: SubscriberCallback,
    pub active: Arc<AtomicBool>,
}

/// Mutable registry behind the multiplexer's lock
#[derive(Default)]
pub(crate) struct RegistryState {
    pub handles: HashMap<ChannelKey, ChannelHandle>,
    pub subscribers: HashMap<SubscriberId, SubscriberEntry>,
    pub next_channel_seq: u64,
    /// Never reused, so a torn-down handle's stragglers cannot match its successor
    pub epoch_seq: u64,
}

impl RegistryState {
    pub fn channel_name(&mut self, key: &ChannelKey) -> String {
        self.next_channel_seq += 1;
        format!("{}:{}", key.topic(), self.next_channel_seq)
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.epoch_seq += 1;
        self.epoch_seq
    }
}
