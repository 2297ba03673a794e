//! Named-topic event listener.
//!
//! Components publish string payloads under a topic name; any number of
//! subscribers receive every payload emitted after they subscribed, in
//! emission order. Subscribers whose receiver was dropped are pruned on the
//! next emission.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

/// Emitted with an address when all protocol connections of that address must close.
pub const CLOSE_CONNECTION_EVENT: &str = "closeConnection";

/// Emitted with an account id after the account logged out.
pub const LOGOUT_EVENT: &str = "logout";

/// Emitted with an account id after the account was deleted.
pub const USER_DELETED_EVENT: &str = "userDeleted";

/// Cheaply clonable publish/subscribe hub.
#[derive(Debug, Clone, Default)]
pub struct Listener {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>,
}

impl Listener {
    /// Creates a listener with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel for a topic.
    pub fn add(&self, topic: &str, sender: mpsc::UnboundedSender<String>) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(sender);
    }

    /// Subscribes to a topic and returns the receiving end.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(topic, tx);
        rx
    }

    /// Publishes a payload to every live subscriber of a topic.
    pub fn emit(&self, topic: &str, data: impl Into<String>) {
        let data = data.into();
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = topics.get_mut(topic) else {
            trace!(topic, "No subscribers");
            return;
        };
        senders.retain(|tx| tx.send(data.clone()).is_ok());
        trace!(topic, data = %data, subscribers = senders.len(), "Event emitted");
    }

    /// Number of live subscribers of a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers_in_order() {
        let listener = Listener::new();
        let mut a = listener.subscribe(CLOSE_CONNECTION_EVENT);
        let mut b = listener.subscribe(CLOSE_CONNECTION_EVENT);

        listener.emit(CLOSE_CONNECTION_EVENT, "one@example.com");
        listener.emit(CLOSE_CONNECTION_EVENT, "two@example.com");

        assert_eq!(a.recv().await.unwrap(), "one@example.com");
        assert_eq!(a.recv().await.unwrap(), "two@example.com");
        assert_eq!(b.recv().await.unwrap(), "one@example.com");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let listener = Listener::new();
        let mut close = listener.subscribe(CLOSE_CONNECTION_EVENT);

        listener.emit(LOGOUT_EVENT, "user-1");
        listener.emit(CLOSE_CONNECTION_EVENT, "a@example.com");

        assert_eq!(close.recv().await.unwrap(), "a@example.com");
        assert!(close.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let listener = Listener::new();
        let rx = listener.subscribe(LOGOUT_EVENT);
        assert_eq!(listener.subscriber_count(LOGOUT_EVENT), 1);

        drop(rx);
        listener.emit(LOGOUT_EVENT, "user-1");
        assert_eq!(listener.subscriber_count(LOGOUT_EVENT), 0);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        Listener::new().emit(USER_DELETED_EVENT, "user-1");
    }
}
