//! Local data store seam.
//!
//! Each account session owns at most one local store, opened on its first
//! protocol login. The store indexes synchronized mail and builds full
//! message literals; the gateway core only needs the small surface below.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Errors reported by a local store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// No message with this id.
    #[error("message {0} not found")]
    MessageNotFound(String),

    /// Building the literal failed.
    #[error("failed to build message {id}: {reason}")]
    Build {
        /// Message id.
        id: String,
        /// What went wrong.
        reason: String,
    },

    /// The store could not be opened or has been closed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Change event emitted by a store for the IDLE machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Message count of a mailbox changed.
    Mailbox {
        /// Owning account id.
        user_id: String,
        /// Mailbox name.
        mailbox: String,
        /// New message count.
        messages: u32,
    },
    /// Flags of a message changed.
    Message {
        /// Owning account id.
        user_id: String,
        /// Mailbox name.
        mailbox: String,
        /// Message UID.
        uid: u32,
        /// Current flags.
        flags: Vec<String>,
    },
    /// A message was expunged.
    Expunge {
        /// Owning account id.
        user_id: String,
        /// Mailbox name.
        mailbox: String,
        /// Sequence number before removal.
        seq: u32,
    },
}

impl Update {
    /// Returns the id of the account this update belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::Mailbox { user_id, .. }
            | Self::Message { user_id, .. }
            | Self::Expunge { user_id, .. } => user_id,
        }
    }
}

/// Receives store change events.
pub trait ChangeNotifier: Send + Sync {
    /// Called synchronously, in emission order, for every change.
    fn notify(&self, update: Update);
}

/// Metadata of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    /// Message id.
    pub id: String,
    /// Current flags.
    pub flags: Vec<String>,
    /// Literal size in bytes.
    pub size: u32,
}

/// Per-account local store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Installs the notifier that receives change events, replacing any previous one.
    fn set_change_notifier(&self, notifier: Arc<dyn ChangeNotifier>);

    /// Returns message metadata.
    async fn message(&self, id: &str) -> StoreResult<MessageMeta>;

    /// Builds the full RFC 822 literal of a message.
    async fn build_literal(&self, id: &str) -> StoreResult<Bytes>;
}

/// Opens and removes local stores.
pub trait StoreMaker: Send + Sync {
    /// Opens (creating if needed) the store of an account, unlocked with `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    fn open(&self, user_id: &str, key: &str) -> StoreResult<Arc<dyn Store>>;

    /// Deletes all local data of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be removed.
    fn remove(&self, user_id: &str) -> StoreResult<()>;
}
