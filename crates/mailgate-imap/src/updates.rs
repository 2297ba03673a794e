//! Shared change-event queue for IDLE.
//!
//! Every connected account's local store pushes its changes into one
//! [`ImapUpdates`]. Events are forwarded in emission order into a single
//! unbounded queue that the protocol layer drains. Events of accounts that
//! have no live backend session are dropped.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};

use mailgate_core::{ChangeNotifier, Update};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// Change notifier feeding the backend's update stream.
#[derive(Debug)]
pub struct ImapUpdates {
    tx: UnboundedSender<Update>,
    rx: Mutex<Option<UnboundedReceiver<Update>>>,
    active: RwLock<HashSet<String>>,
}

impl Default for ImapUpdates {
    fn default() -> Self {
        Self::new()
    }
}

impl ImapUpdates {
    /// Creates an empty queue with no active accounts.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            active: RwLock::new(HashSet::new()),
        }
    }

    /// Starts forwarding events of an account.
    pub fn activate(&self, user_id: &str) {
        let inserted = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string());
        if inserted {
            debug!(user_id, "Updates activated");
        }
    }

    /// Stops forwarding events of an account.
    pub fn deactivate(&self, user_id: &str) {
        let removed = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
        if removed {
            debug!(user_id, "Updates deactivated");
        }
    }

    /// Whether events of the account are forwarded.
    #[must_use]
    pub fn is_active(&self, user_id: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_id)
    }

    /// Takes the receiving end of the queue. Only the first call gets it.
    #[must_use]
    pub fn take_receiver(&self) -> Option<UnboundedReceiver<Update>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl ChangeNotifier for ImapUpdates {
    fn notify(&self, update: Update) {
        if !self.is_active(update.user_id()) {
            trace!(user_id = update.user_id(), "Dropping update of inactive user");
            return;
        }
        if self.tx.send(update).is_err() {
            trace!("Update receiver dropped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn expunge(user_id: &str, seq: u32) -> Update {
        Update::Expunge {
            user_id: user_id.to_string(),
            mailbox: "INBOX".to_string(),
            seq,
        }
    }

    #[test]
    fn test_receiver_is_taken_once() {
        let updates = ImapUpdates::new();
        assert!(updates.take_receiver().is_some());
        assert!(updates.take_receiver().is_none());
    }

    #[test]
    fn test_inactive_users_are_dropped() {
        let updates = ImapUpdates::new();
        let mut rx = updates.take_receiver().unwrap();

        updates.notify(expunge("u1", 1));
        updates.activate("u2");
        updates.notify(expunge("u2", 2));

        assert_eq!(rx.try_recv().unwrap(), expunge("u2", 2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_order_is_preserved() {
        let updates = ImapUpdates::new();
        let mut rx = updates.take_receiver().unwrap();
        updates.activate("u1");

        for seq in 1..=5 {
            updates.notify(expunge("u1", seq));
        }

        for seq in 1..=5 {
            assert_eq!(rx.try_recv().unwrap(), expunge("u1", seq));
        }
    }

    #[test]
    fn test_deactivate_stops_forwarding() {
        let updates = ImapUpdates::new();
        let mut rx = updates.take_receiver().unwrap();
        updates.activate("u1");
        updates.deactivate("u1");
        updates.deactivate("u1");

        updates.notify(expunge("u1", 1));
        assert!(rx.try_recv().is_err());
        assert!(!updates.is_active("u1"));
    }
}
