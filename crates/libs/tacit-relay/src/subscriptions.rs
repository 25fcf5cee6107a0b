use std::collections::BTreeMap;
use std::sync::RwLock;

use tacit_store::{SubscriptionId, Topic};

/// Acknowledged relay subscriptions: topic → subscription id.
///
/// `insert`/`remove` report the emptiness transition so the caller can decide
/// to start or stop connection keep-alive backoff; the set itself has no side
/// effects.
#[derive(Default)]
pub struct SubscriptionSet {
    inner: RwLock<BTreeMap<Topic, SubscriptionId>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an acknowledged subscription. Returns `true` when the set just
    /// became non-empty.
    pub fn insert(&self, topic: Topic, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let was_empty = inner.is_empty();
        inner.insert(topic, id);
        was_empty
    }

    /// Removes a topic, returning its subscription id and `true` when the set
    /// just became empty.
    pub fn remove(&self, topic: &Topic) -> (Option<SubscriptionId>, bool) {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let removed = inner.remove(topic);
        let now_empty = removed.is_some() && inner.is_empty();
        (removed, now_empty)
    }

    pub fn get(&self, topic: &Topic) -> Option<SubscriptionId> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.get(topic).cloned()
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<Topic> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.keys().cloned().collect()
    }

    /// Drops every acknowledgement. Called on disconnect: subscription ids do
    /// not survive the connection, so everything must be re-subscribed.
    pub fn clear(&self) -> Vec<Topic> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let topics = inner.keys().cloned().collect();
        inner.clear();
        topics
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_report_emptiness_transitions() {
        let set = SubscriptionSet::new();
        let first = Topic::generate();
        let second = Topic::generate();

        assert!(set.insert(first.clone(), "sub-1".to_owned()));
        assert!(!set.insert(second.clone(), "sub-2".to_owned()));

        let (id, now_empty) = set.remove(&first);
        assert_eq!(id.as_deref(), Some("sub-1"));
        assert!(!now_empty);

        let (id, now_empty) = set.remove(&second);
        assert_eq!(id.as_deref(), Some("sub-2"));
        assert!(now_empty);

        let (id, now_empty) = set.remove(&second);
        assert_eq!(id, None);
        assert!(!now_empty);
    }

    #[test]
    fn clear_returns_previously_acked_topics() {
        let set = SubscriptionSet::new();
        let topic = Topic::generate();
        set.insert(topic.clone(), "sub-1".to_owned());
        assert_eq!(set.clear(), vec![topic.clone()]);
        assert!(set.is_empty());
        assert!(!set.contains(&topic));
    }
}
