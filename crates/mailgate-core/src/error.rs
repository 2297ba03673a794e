//! Error types for the core library.

use thiserror::Error;

use crate::account::CredentialError;
use crate::api::ApiError;
use crate::store::StoreError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The mailbox password could not unlock the account keys.
    #[error("the mailbox password is incorrect")]
    WrongMailboxPassword,

    /// The account already has a live, connected session.
    #[error("user is already connected")]
    AlreadyConnected,

    /// No account session matches the query.
    #[error("user {0} not found")]
    UserNotFound(String),

    /// The account session exists but is not connected.
    #[error("user is logged out")]
    LoggedOut,

    /// Gateway credentials (key slot or slot password) do not match.
    #[error("backend login credentials are invalid")]
    BadCredentials,

    /// The remote profile does not belong to the authenticated account.
    #[error("authenticated account {auth} does not match profile {profile}")]
    AccountMismatch {
        /// Account id carried by the auth value.
        auth: String,
        /// Account id reported by the remote profile.
        profile: String,
    },

    /// Remote account service failed.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Credential storage failed.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Local data store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Broad category of an [`Error`], used by protocol layers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong password or rejected credentials. Shown to the user, never retried.
    Authentication,
    /// The account is already connected elsewhere.
    Conflict,
    /// Network or remote service failure. Retry is up to the caller.
    Upstream,
    /// Persisting credentials failed.
    Persistence,
    /// Anything else.
    Internal,
}

impl Error {
    /// Returns the category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::WrongMailboxPassword | Self::BadCredentials | Self::LoggedOut => {
                ErrorKind::Authentication
            }
            Self::Api(ApiError::Unauthorized(_)) => ErrorKind::Authentication,
            Self::AlreadyConnected => ErrorKind::Conflict,
            Self::Api(_) | Self::AccountMismatch { .. } => ErrorKind::Upstream,
            Self::Credential(_) => ErrorKind::Persistence,
            Self::UserNotFound(_) | Self::Store(_) | Self::Io(_) | Self::Serde(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
