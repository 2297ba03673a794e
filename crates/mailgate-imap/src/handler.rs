//! Protocol handler contract.
//!
//! The IMAP server drives a backend through these two traits: one
//! [`Backend`] per server, and one [`BackendUser`] per authenticated
//! connection.
//!
//! # Example
//!
//! ```ignore
//! use mailgate_imap::handler::{Backend, BackendUser, FetchItem};
//!
//! let user = backend.login("alice@example.com:laptop", &password).await?;
//! let results = user
//!     .fetch_messages(vec!["m1".into(), "m2".into()], &[FetchItem::Flags, FetchItem::Literal])
//!     .await?;
//! for (id, message) in results {
//!     match message {
//!         Ok(message) => println!("{id}: {:?}", message.flags),
//!         Err(e) => eprintln!("{id}: {e}"),
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mailgate_core::Update;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::Result;

/// Data item requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchItem {
    /// Current flags.
    Flags,
    /// Literal size.
    Size,
    /// Full RFC 822 literal.
    Literal,
}

/// Requested data of one message. Items not requested are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Message id.
    pub id: String,
    /// Current flags.
    pub flags: Option<Vec<String>>,
    /// Literal size in bytes.
    pub size: Option<u32>,
    /// Full literal.
    pub literal: Option<Bytes>,
}

/// Per-connection view of an authenticated account.
#[async_trait]
pub trait BackendUser: Send + Sync {
    /// Canonical address of the account.
    fn username(&self) -> &str;

    /// Ends protocol use of the account and forgets its cached session.
    async fn logout(&self);

    /// Fetches `items` for every message in `ids`.
    ///
    /// Results come back in the order of `ids`, each with its own outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if no message can be fetched at all, for example
    /// because the account has no open local store.
    async fn fetch_messages(
        &self,
        ids: Vec<String>,
        items: &[FetchItem],
    ) -> Result<Vec<(String, Result<FetchedMessage>)>>;
}

/// Server-wide backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Session type handed to authenticated connections.
    type User: BackendUser;

    /// Authenticates a client login (`address` or `address:slot`).
    ///
    /// # Errors
    ///
    /// Returns an error if the account cannot be resolved or the password
    /// is wrong.
    async fn login(&self, username: &str, password: &str) -> Result<Arc<Self::User>>;

    /// Takes the stream of change events for IDLE. Only the first call gets it.
    fn updates(&self) -> Option<UnboundedReceiver<Update>>;

    /// Maximum size of an appended message, `None` for no limit.
    fn create_message_limit(&self) -> Option<u32>;
}
