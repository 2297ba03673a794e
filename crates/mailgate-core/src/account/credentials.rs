//! Persistent credential storage.
//!
//! [`CredentialStore`] is the single-writer vault for account credentials.
//! Implementations only provide raw record access (`list`, `get`, `put`,
//! `delete`); the mutating operations are built on top of those and are
//! shared by every backend.
//!
//! [`KeyringCredentialStore`] keeps records in the platform's native
//! credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use keyring::Entry;
use tracing::{debug, warn};

use super::keys::password_digest;
use super::model::Credentials;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "mailgate";

/// Keyring user under which the list of account ids is stored.
const INDEX_ENTRY: &str = "mailgate_index";

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// No credentials stored for this account.
    #[error("no credentials stored for account {0}")]
    NotFound(String),

    /// No key slot with this name.
    #[error("key slot {slot:?} not found for account {user_id}")]
    KeySlotNotFound {
        /// Account id.
        user_id: String,
        /// Slot name.
        slot: String,
    },

    /// Stored record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Backend-specific write failure.
    #[error("failed to write credentials: {0}")]
    Write(String),
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Keyed-by-account-id store of credentials.
pub trait CredentialStore: Send + Sync {
    /// Lists the ids of all stored accounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn list(&self) -> CredentialResult<Vec<String>>;

    /// Loads the record of an account.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] if no record exists.
    fn get(&self, user_id: &str) -> CredentialResult<Credentials>;

    /// Writes a record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn put(&self, credentials: &Credentials) -> CredentialResult<()>;

    /// Deletes the record of an account. Deleting a missing record is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn delete(&self, user_id: &str) -> CredentialResult<()>;

    /// Creates (or replaces) the record of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn add(
        &self,
        user_id: &str,
        name: &str,
        uid: &str,
        refresh_token: &str,
        mailbox_secret: &[u8],
        emails: &[String],
    ) -> CredentialResult<Credentials> {
        let credentials =
            Credentials::new(user_id, name, uid, refresh_token, mailbox_secret, emails);
        self.put(&credentials)?;
        debug!(user_id, "Added credentials");
        Ok(credentials)
    }

    /// Replaces the auth session tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or cannot be persisted.
    fn update_token(
        &self,
        user_id: &str,
        uid: &str,
        refresh_token: &str,
    ) -> CredentialResult<Credentials> {
        modify(self, user_id, |c| {
            c.uid = uid.to_string();
            c.refresh_token = refresh_token.to_string();
            Ok(())
        })
    }

    /// Replaces the mailbox secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or cannot be persisted.
    fn update_password(
        &self,
        user_id: &str,
        mailbox_secret: &[u8],
    ) -> CredentialResult<Credentials> {
        modify(self, user_id, |c| {
            c.mailbox_secret = mailbox_secret.to_vec();
            Ok(())
        })
    }

    /// Replaces the address list.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or cannot be persisted.
    fn update_emails(&self, user_id: &str, emails: &[String]) -> CredentialResult<Credentials> {
        modify(self, user_id, |c| {
            c.emails = emails.to_vec();
            Ok(())
        })
    }

    /// Stores a fresh auth session, secret and address list in one write.
    ///
    /// `default_slot` (name, password) is registered only if the record has
    /// no key slot; the returned flag tells whether it was.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or cannot be persisted. The
    /// stored record is then unchanged.
    fn reactivate(
        &self,
        user_id: &str,
        uid: &str,
        refresh_token: &str,
        mailbox_secret: &[u8],
        emails: &[String],
        default_slot: (&str, &str),
    ) -> CredentialResult<(Credentials, bool)> {
        let mut slot_added = false;
        let credentials = modify(self, user_id, |c| {
            uid.clone_into(&mut c.uid);
            refresh_token.clone_into(&mut c.refresh_token);
            c.mailbox_secret = mailbox_secret.to_vec();
            c.emails = emails.to_vec();
            if c.key_slots.is_empty() {
                let (slot, password) = default_slot;
                c.key_slots.insert(slot.to_string(), password_digest(password));
                slot_added = true;
            }
            Ok(())
        })?;
        debug!(user_id, slot_added, "Reactivated credentials");
        Ok((credentials, slot_added))
    }

    /// Clears the auth session and secret of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or cannot be persisted.
    fn logout(&self, user_id: &str) -> CredentialResult<Credentials> {
        modify(self, user_id, |c| {
            c.clear_session();
            Ok(())
        })
    }

    /// Registers a key slot, storing only a digest of its password.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or cannot be persisted.
    fn add_key_slot(
        &self,
        user_id: &str,
        slot: &str,
        password: &str,
    ) -> CredentialResult<Credentials> {
        modify(self, user_id, |c| {
            c.key_slots.insert(slot.to_string(), password_digest(password));
            Ok(())
        })
    }

    /// Removes a key slot.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::KeySlotNotFound`] if the slot does not exist.
    fn remove_key_slot(&self, user_id: &str, slot: &str) -> CredentialResult<Credentials> {
        modify(self, user_id, |c| {
            c.key_slots
                .remove(slot)
                .map(|_| ())
                .ok_or_else(|| CredentialError::KeySlotNotFound {
                    user_id: user_id.to_string(),
                    slot: slot.to_string(),
                })
        })
    }

    /// Lists key slot names.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing.
    fn list_key_slots(&self, user_id: &str) -> CredentialResult<Vec<String>> {
        Ok(self.get(user_id)?.key_slots.into_keys().collect())
    }
}

/// Loads, changes and writes back a record.
fn modify<S, F>(store: &S, user_id: &str, change: F) -> CredentialResult<Credentials>
where
    S: CredentialStore + ?Sized,
    F: FnOnce(&mut Credentials) -> CredentialResult<()>,
{
    let mut credentials = store.get(user_id)?;
    change(&mut credentials)?;
    credentials.touch();
    store.put(&credentials)?;
    Ok(credentials)
}

/// Credential store backed by the system keyring.
///
/// Each account is one JSON entry; an index entry lists the account ids
/// since keyrings cannot be enumerated portably.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeyringCredentialStore {
    /// Creates a store using the given keyring service name.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, user_id: &str) -> CredentialResult<Entry> {
        Ok(Entry::new(&self.service, &format!("{}_credentials_{user_id}", self.service))?)
    }

    fn index(&self) -> CredentialResult<Entry> {
        Ok(Entry::new(&self.service, INDEX_ENTRY)?)
    }

    fn read_index(&self) -> CredentialResult<Vec<String>> {
        match self.index()?.get_password() {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(keyring::Error::NoEntry) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_index(&self, ids: &[String]) -> CredentialResult<()> {
        let json = serde_json::to_string(ids)?;
        self.index()?.set_password(&json)?;
        Ok(())
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn list(&self) -> CredentialResult<Vec<String>> {
        self.read_index()
    }

    fn get(&self, user_id: &str) -> CredentialResult<Credentials> {
        match self.entry(user_id)?.get_password() {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(keyring::Error::NoEntry) => {
                debug!(user_id, "No credentials found");
                Err(CredentialError::NotFound(user_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, credentials: &Credentials) -> CredentialResult<()> {
        let json = serde_json::to_string(credentials)?;
        self.entry(&credentials.user_id)?.set_password(&json)?;

        let mut ids = self.read_index()?;
        if !ids.contains(&credentials.user_id) {
            ids.push(credentials.user_id.clone());
            self.write_index(&ids)?;
        }
        debug!(user_id = %credentials.user_id, "Stored credentials");
        Ok(())
    }

    fn delete(&self, user_id: &str) -> CredentialResult<()> {
        match self.entry(user_id)?.delete_credential() {
            Ok(()) => debug!(user_id, "Deleted credentials"),
            Err(keyring::Error::NoEntry) => debug!(user_id, "No credentials to delete"),
            Err(e) => {
                warn!(user_id, "Failed to delete credentials: {e}");
                return Err(e.into());
            }
        }

        let mut ids = self.read_index()?;
        let before = ids.len();
        ids.retain(|id| id != user_id);
        if ids.len() != before {
            self.write_index(&ids)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // Note: These tests interact with the actual system keyring.
    // They are marked as ignored by default to avoid polluting the keyring
    // during automated testing. Run manually with `cargo test -- --ignored`

    use super::*;

    fn store() -> KeyringCredentialStore {
        KeyringCredentialStore::new("mailgate-test")
    }

    #[test]
    #[ignore = "Interacts with system keyring"]
    fn test_store_and_retrieve_credentials() {
        let store = store();
        let emails = vec!["keyring@example.com".to_string()];

        store.add("kr-1", "keyring", "uid", "ref", b"secret", &emails).unwrap();

        let loaded = store.get("kr-1").unwrap();
        assert_eq!(loaded.emails, emails);
        assert!(store.list().unwrap().contains(&"kr-1".to_string()));

        store.delete("kr-1").unwrap();
        assert!(matches!(store.get("kr-1"), Err(CredentialError::NotFound(_))));
    }

    #[test]
    #[ignore = "Interacts with system keyring"]
    fn test_delete_missing_is_noop() {
        store().delete("kr-missing").unwrap();
    }
}
