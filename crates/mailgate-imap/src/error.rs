//! Error types for the IMAP backend.

use thiserror::Error;

/// Errors that can occur in backend operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The login could not be resolved to an account session.
    #[error("cannot resolve user {address}: {source}")]
    Resolve {
        /// Lowercased login address.
        address: String,
        /// Why resolution failed.
        #[source]
        source: mailgate_core::Error,
    },

    /// The account session rejected the presented credentials.
    #[error("login failed for {address}: {source}")]
    Login {
        /// Lowercased login address.
        address: String,
        /// The credential check error.
        #[source]
        source: mailgate_core::Error,
    },

    /// The session has no open local store.
    #[error("no local store for user {0}")]
    NoStore(String),

    /// A local store operation failed.
    #[error("store error: {0}")]
    Store(#[from] mailgate_core::StoreError),

    /// The message builder has shut down.
    #[error("message builder is closed")]
    BuilderClosed,

    /// A fetch worker panicked or was cancelled.
    #[error("fetch worker failed: {0}")]
    Worker(String),
}

impl Error {
    /// Returns the core error behind a failed login, if any.
    #[must_use]
    pub const fn core(&self) -> Option<&mailgate_core::Error> {
        match self {
            Self::Resolve { source, .. } | Self::Login { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mailgate_core::ErrorKind;

    #[test]
    fn test_login_error_exposes_core_kind() {
        let err = Error::Login {
            address: "a@example.com".to_string(),
            source: mailgate_core::Error::BadCredentials,
        };
        assert_eq!(err.core().unwrap().kind(), ErrorKind::Authentication);
        assert!(err.to_string().contains("a@example.com"));
    }

    #[test]
    fn test_store_error_has_no_core() {
        let err = Error::from(mailgate_core::StoreError::MessageNotFound("m1".into()));
        assert!(err.core().is_none());
        assert_eq!(err.to_string(), "store error: message m1 not found");
    }
}
