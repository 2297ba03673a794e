//! # mailgate-imap
//!
//! IMAP backend of the `MailGate` gateway.
//!
//! The backend sits below the IMAP server. It turns client logins into
//! account sessions from [`mailgate_core::Users`], keeps one protocol
//! session per account however many aliases log in, and bounds the work a
//! burst of fetch requests can put on the account's store.
//!
//! ## Concurrency layers
//!
//! - Each fetch request is handled on its connection's task.
//! - Within a request, items are resolved by a fresh [`FetchPool`] of
//!   `list_workers` workers.
//! - Workers needing a full literal submit a job to the backend's single
//!   [`MessageBuilder`], which runs at most `build_workers` builds at once.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailgate_core::{Listener, Settings, Users};
//! use mailgate_imap::{Backend, BackendConfig, BackendUser, FetchItem, ImapBackend};
//!
//! let settings = Settings::new(Settings::default_path());
//! let listener = Listener::new();
//! let users = Arc::new(Users::new(credentials, clients, stores, listener.clone()).await?);
//!
//! let backend = ImapBackend::new(users, &listener, BackendConfig::from_settings(&settings));
//! let mut updates = backend.updates().expect("first caller");
//!
//! let user = backend.login("alice@example.com", &bridge_password).await?;
//! let messages = user.fetch_messages(ids, &[FetchItem::Flags, FetchItem::Literal]).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod backend;
pub mod builder;
pub mod config;
mod error;
pub mod fetch;
pub mod handler;
pub mod updates;
mod user;

pub use backend::ImapBackend;
pub use builder::MessageBuilder;
pub use config::BackendConfig;
pub use error::{Error, Result};
pub use fetch::FetchPool;
pub use handler::{Backend, BackendUser, FetchItem, FetchedMessage};
pub use updates::ImapUpdates;
pub use user::ImapUser;
