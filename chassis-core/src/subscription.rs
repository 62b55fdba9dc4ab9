//! Prefix subscription matching for SUB sockets.
//!
//! Filters are reference counted the way native message-queue libraries count
//! them: subscribing twice to the same prefix needs two unsubscribes before
//! the prefix stops matching.

use bytes::Bytes;

/// A subscription entry with topic prefix
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Topic prefix (empty = subscribe to all)
    pub prefix: Bytes,
    refs: usize,
}

impl Subscription {
    /// Create a new subscription for a topic prefix
    #[must_use]
    pub const fn new(prefix: Bytes) -> Self {
        Self { prefix, refs: 1 }
    }

    /// Check if this subscription matches a given topic
    #[must_use]
    pub fn matches(&self, topic: &[u8]) -> bool {
        topic.starts_with(&self.prefix)
    }
}

/// Subscription storage used by the publisher side to filter fan-out.
#[derive(Debug, Default)]
pub struct SubscriptionTrie {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionTrie {
    /// Create a new empty subscription trie
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }

    /// Add a subscription, bumping the count of an existing prefix.
    pub fn subscribe(&mut self, prefix: Bytes) {
        match self.subscriptions.iter_mut().find(|s| s.prefix == prefix) {
            Some(existing) => existing.refs += 1,
            None => self.subscriptions.push(Subscription::new(prefix)),
        }
    }

    /// Drop one reference to a prefix.
    ///
    /// Returns false if the prefix was not subscribed at all.
    pub fn unsubscribe(&mut self, prefix: &[u8]) -> bool {
        let Some(pos) = self.subscriptions.iter().position(|s| s.prefix == prefix) else {
            return false;
        };
        self.subscriptions[pos].refs -= 1;
        if self.subscriptions[pos].refs == 0 {
            self.subscriptions.swap_remove(pos);
        }
        true
    }

    /// Check if a topic matches any subscription
    ///
    /// No subscriptions means nothing is delivered.
    #[must_use]
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.subscriptions.iter().any(|s| s.matches(topic))
    }

    /// Get all subscriptions
    #[must_use]
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Check if there are no subscriptions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Get the number of distinct prefixes
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Clear all subscriptions
    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_matches() {
        let sub = Subscription::new(Bytes::from_static(b"topic."));

        assert!(sub.matches(b"topic.foo"));
        assert!(sub.matches(b"topic.bar"));
        assert!(!sub.matches(b"other.foo"));
        assert!(!sub.matches(b"topi"));
    }

    #[test]
    fn test_empty_subscription_matches_all() {
        let sub = Subscription::new(Bytes::new());

        assert!(sub.matches(b"anything"));
        assert!(sub.matches(b""));
    }

    #[test]
    fn test_trie_basic() {
        let mut trie = SubscriptionTrie::new();

        assert!(!trie.matches(b"topic.foo"));

        trie.subscribe(Bytes::from_static(b"topic."));
        assert!(trie.matches(b"topic.foo"));
        assert!(!trie.matches(b"other.foo"));

        assert!(trie.unsubscribe(b"topic."));
        assert!(!trie.matches(b"topic.foo"));
        assert!(!trie.unsubscribe(b"topic."));
    }

    #[test]
    fn test_trie_counts_duplicates() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe(Bytes::from_static(b"temperature"));
        trie.subscribe(Bytes::from_static(b"temperature"));
        assert_eq!(trie.len(), 1);

        trie.unsubscribe(b"temperature");
        assert!(trie.matches(b"temperature"));
        trie.unsubscribe(b"temperature");
        assert!(trie.is_empty());
    }

    #[test]
    fn test_trie_multiple_subscriptions() {
        let mut trie = SubscriptionTrie::new();

        trie.subscribe(Bytes::from_static(b"topic."));
        trie.subscribe(Bytes::from_static(b"events."));

        assert!(trie.matches(b"topic.foo"));
        assert!(trie.matches(b"events.bar"));
        assert!(!trie.matches(b"other.baz"));
    }
}
