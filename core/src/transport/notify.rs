//! Reference-counted notification subscriptions per peripheral
//!
//! The device-level "notify on" request is only needed for the first
//! subscriber of a topic and "notify off" only after the last one leaves.

use super::abstraction::CharacteristicId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Callback invoked with every raw notification fragment of a topic
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Device-level notify state of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    Off,
    /// "notify on" was requested by the first subscriber and has not been
    /// acknowledged yet
    Enabling,
    On,
}

/// Outcome of removing a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsubscribed {
    /// The subscriber was already gone
    NotSubscribed,
    /// Other subscribers remain on the topic
    Remaining(usize),
    /// That was the last subscriber; the device should be told to stop
    Last,
}

struct Topic {
    subscribers: Vec<(SubscriberId, NotificationCallback)>,
    state: NotifyState,
}

#[derive(Default)]
pub struct NotificationBus {
    topics: HashMap<CharacteristicId, Topic>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback on `topic`. Returns the subscriber id and whether
    /// the caller is responsible for turning notifications on.
    pub fn subscribe(
        &mut self,
        topic: CharacteristicId,
        callback: NotificationCallback,
    ) -> (SubscriberId, bool) {
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));

        let entry = self.topics.entry(topic).or_insert_with(|| Topic {
            subscribers: Vec::new(),
            state: NotifyState::Off,
        });
        entry.subscribers.push((id, callback));

        let must_enable = entry.state == NotifyState::Off;
        if must_enable {
            entry.state = NotifyState::Enabling;
        }
        debug!(
            "Subscribed {:?} to {} ({} subscribers)",
            id,
            topic,
            entry.subscribers.len()
        );
        (id, must_enable)
    }

    /// Record the device acknowledging "notify on"
    pub fn mark_enabled(&mut self, topic: &CharacteristicId) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.state = NotifyState::On;
        }
    }

    /// "notify on" failed; the next subscriber has to try again
    pub fn mark_failed(&mut self, topic: &CharacteristicId) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.state = NotifyState::Off;
        }
    }

    pub fn unsubscribe(&mut self, topic: &CharacteristicId, id: SubscriberId) -> Unsubscribed {
        let Some(entry) = self.topics.get_mut(topic) else {
            return Unsubscribed::NotSubscribed;
        };

        let before = entry.subscribers.len();
        entry.subscribers.retain(|(sid, _)| *sid != id);
        if entry.subscribers.len() == before {
            return Unsubscribed::NotSubscribed;
        }

        if entry.subscribers.is_empty() {
            self.topics.remove(topic);
            debug!("Last subscriber left {}", topic);
            Unsubscribed::Last
        } else {
            Unsubscribed::Remaining(entry.subscribers.len())
        }
    }

    /// Snapshot of the callbacks on `topic`, to be invoked with the lock released
    pub fn callbacks(&self, topic: &CharacteristicId) -> Vec<NotificationCallback> {
        self.topics
            .get(topic)
            .map(|entry| entry.subscribers.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &CharacteristicId) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn state(&self, topic: &CharacteristicId) -> NotifyState {
        self.topics
            .get(topic)
            .map(|entry| entry.state)
            .unwrap_or(NotifyState::Off)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Drop every subscription; the link is gone so nothing is sent
    pub fn clear(&mut self) {
        if !self.topics.is_empty() {
            debug!("Dropping {} notification topics", self.topics.len());
        }
        self.topics.clear();
    }
}
