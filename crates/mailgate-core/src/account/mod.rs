//! Account credentials.
//!
//! Provides the credential record, the credential store contract with its
//! keyring and in-memory implementations, and key derivation.

pub mod credentials;
pub mod keys;
mod memory;
mod model;

pub use credentials::{CredentialError, CredentialResult, CredentialStore, KeyringCredentialStore};
pub use keys::DEFAULT_KEY_SLOT;
pub use memory::MemoryCredentialStore;
pub use model::{ConnectionStatus, Credentials};
