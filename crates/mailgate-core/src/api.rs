//! Remote account service seam.
//!
//! The gateway never talks to the account service directly; it goes through
//! [`ApiClient`] handles produced by a [`ClientManager`]. Both are
//! object-safe so that the HTTP client can be swapped for test doubles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors reported by the remote account service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The auth session was rejected (expired or revoked refresh token).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transport failure talking to the service.
    #[error("network error: {0}")]
    Network(String),

    /// The account keys could not be unlocked with the given passphrase.
    #[error("no keys could be unlocked: {0}")]
    Unlock(String),

    /// The service answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for API operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Token pair issued by the account service for one auth session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRefresh {
    /// Auth session identifier.
    pub uid: String,
    /// Short-lived access token.
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
}

/// Result of a successful first-factor login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Account id the tokens belong to.
    pub user_id: String,
    /// Issued tokens.
    pub refresh: AuthRefresh,
}

impl Auth {
    /// Creates an auth value.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        uid: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            refresh: AuthRefresh {
                uid: uid.into(),
                access_token: access_token.into(),
                refresh_token: refresh_token.into(),
            },
        }
    }
}

/// One address of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Address id on the remote service.
    pub id: String,
    /// Email address as returned by the service.
    pub email: String,
}

/// Account profile as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable account id.
    pub id: String,
    /// Account (login) name.
    pub name: String,
    /// Addresses, primary first.
    pub addresses: Vec<Address>,
}

impl Profile {
    /// Returns the email addresses in service order.
    #[must_use]
    pub fn emails(&self) -> Vec<String> {
        self.addresses.iter().map(|a| a.email.clone()).collect()
    }
}

/// Authenticated handle to the remote account service.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Returns the salt used to hash the mailbox password.
    async fn auth_salt(&self) -> ApiResult<String>;

    /// Unlocks the account keys with the hashed mailbox password.
    async fn unlock(&self, passphrase: &[u8]) -> ApiResult<()>;

    /// Fetches the account profile.
    async fn current_user(&self) -> ApiResult<Profile>;

    /// Revokes the auth session this client was created with.
    async fn auth_delete(&self) -> ApiResult<()>;
}

/// Creates API clients from persisted tokens.
#[async_trait]
pub trait ClientManager: Send + Sync {
    /// Resumes an auth session, returning a client and the refreshed tokens.
    async fn client_with_refresh(
        &self,
        uid: &str,
        refresh_token: &str,
    ) -> ApiResult<(Arc<dyn ApiClient>, AuthRefresh)>;
}
