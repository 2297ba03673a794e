//! # mailgate-core
//!
//! Session core of the `MailGate` local mail gateway.
//!
//! This crate provides:
//! - Account credentials, persisted in the system keyring
//! - The session registry and its login state machine
//! - Key slot derivation for gateway passwords
//! - Event broadcasting between the registry and protocol backends
//! - Persistent settings
//! - The seams to the remote mail service and the local data store

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod api;
mod error;
pub mod events;
pub mod settings;
pub mod store;
pub mod users;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use account::{
    ConnectionStatus, CredentialError, CredentialResult, CredentialStore, Credentials,
    KeyringCredentialStore, MemoryCredentialStore,
};
pub use api::{ApiClient, ApiError, ApiResult, Auth, AuthRefresh, ClientManager, Profile};
pub use error::{Error, ErrorKind, Result};
pub use events::Listener;
pub use settings::Settings;
pub use store::{ChangeNotifier, MessageMeta, Store, StoreError, StoreMaker, StoreResult, Update};
pub use users::{User, Users, decode_login, encode_login};
