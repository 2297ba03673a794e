//! Credential record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of an account session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Loaded from persisted credentials but not authenticated this run.
    #[default]
    Disconnected,
    /// Authenticated with the remote service.
    Connected,
}

impl ConnectionStatus {
    /// Get display name for the status.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

/// Persisted credentials of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Stable account id assigned by the remote service.
    pub user_id: String,
    /// Account name.
    pub name: String,
    /// Email addresses, primary first.
    pub emails: Vec<String>,
    /// Auth session id (empty when logged out).
    pub uid: String,
    /// Refresh token (empty when logged out).
    pub refresh_token: String,
    /// Mailbox-password-derived secret (empty when logged out).
    pub mailbox_secret: Vec<u8>,
    /// Key slot name to SHA-256 hex digest of the slot password.
    pub key_slots: BTreeMap<String, String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Credentials {
    /// Creates a connected record.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
        refresh_token: impl Into<String>,
        mailbox_secret: &[u8],
        emails: &[String],
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            emails: emails.to_vec(),
            uid: uid.into(),
            refresh_token: refresh_token.into(),
            mailbox_secret: mailbox_secret.to_vec(),
            key_slots: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the record still holds a usable auth session and secret.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.uid.is_empty() && !self.mailbox_secret.is_empty()
    }

    /// Primary address, lowercased. Empty if the record has no address.
    #[must_use]
    pub fn primary_address(&self) -> String {
        self.emails
            .first()
            .map(|e| e.to_lowercase())
            .unwrap_or_default()
    }

    /// Clears the auth session and secret, keeping identity and key slots.
    pub fn clear_session(&mut self) {
        self.uid.clear();
        self.refresh_token.clear();
        self.mailbox_secret.clear();
        self.touch();
    }

    /// Bumps the modification time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials::new(
            "user-1",
            "alice",
            "uid-1",
            "ref-1",
            b"secret",
            &["Alice@Example.com".to_string(), "alias@example.com".to_string()],
        )
    }

    #[test]
    fn test_new_record_is_connected() {
        let creds = sample();
        assert!(creds.is_connected());
        assert_eq!(creds.primary_address(), "alice@example.com");
    }

    #[test]
    fn test_clear_session_keeps_identity() {
        let mut creds = sample();
        creds.key_slots.insert(String::new(), "digest".to_string());

        creds.clear_session();

        assert!(!creds.is_connected());
        assert_eq!(creds.user_id, "user-1");
        assert_eq!(creds.emails.len(), 2);
        assert_eq!(creds.key_slots.len(), 1);
    }

    #[test]
    fn test_record_without_secret_is_not_connected() {
        let mut creds = sample();
        creds.mailbox_secret.clear();
        assert!(!creds.is_connected());
    }

    #[test]
    fn test_status_display_name() {
        assert_eq!(ConnectionStatus::default().display_name(), "disconnected");
        assert_eq!(ConnectionStatus::Connected.display_name(), "connected");
    }
}
