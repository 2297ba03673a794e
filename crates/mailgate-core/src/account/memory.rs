//! In-process credential store.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::credentials::{CredentialError, CredentialResult, CredentialStore};
use super::model::Credentials;

/// Credential store that keeps records in memory.
///
/// Used for headless runs where no keyring is available, and in tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: Mutex<BTreeMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = Credentials>) -> Self {
        let records = records
            .into_iter()
            .map(|c| (c.user_id.clone(), c))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Credentials>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn list(&self) -> CredentialResult<Vec<String>> {
        Ok(self.records().keys().cloned().collect())
    }

    fn get(&self, user_id: &str) -> CredentialResult<Credentials> {
        self.records()
            .get(user_id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(user_id.to_string()))
    }

    fn put(&self, credentials: &Credentials) -> CredentialResult<()> {
        self.records()
            .insert(credentials.user_id.clone(), credentials.clone());
        Ok(())
    }

    fn delete(&self, user_id: &str) -> CredentialResult<()> {
        self.records().remove(user_id);
        Ok(())
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
    use crate::account::keys::password_digest;

    fn emails() -> Vec<String> {
        vec!["bob@example.com".to_string()]
    }

    #[test]
    fn test_add_and_get() {
        let store = MemoryCredentialStore::new();
        store.add("u1", "bob", "uid", "ref", b"secret", &emails()).unwrap();

        let creds = store.get("u1").unwrap();
        assert_eq!(creds.name, "bob");
        assert!(creds.is_connected());
        assert_eq!(store.list().unwrap(), vec!["u1".to_string()]);
    }

    #[test]
    fn test_get_missing_is_error() {
        let store = MemoryCredentialStore::new();
        assert!(matches!(store.get("nope"), Err(CredentialError::NotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_update_on_missing_is_error() {
        let store = MemoryCredentialStore::new();
        assert!(store.update_token("nope", "uid", "ref").is_err());
        assert!(store.update_password("nope", b"x").is_err());
        assert!(store.logout("nope").is_err());
    }

    #[test]
    fn test_update_token_and_password() {
        let store = MemoryCredentialStore::new();
        store.add("u1", "bob", "uid", "ref", b"old", &emails()).unwrap();

        store.update_token("u1", "uid2", "ref2").unwrap();
        let creds = store.update_password("u1", b"new").unwrap();

        assert_eq!(creds.uid, "uid2");
        assert_eq!(creds.refresh_token, "ref2");
        assert_eq!(creds.mailbox_secret, b"new".to_vec());
        assert_eq!(store.get("u1").unwrap(), creds);
    }

    #[test]
    fn test_reactivate_adds_default_slot_only_when_missing() {
        let store = MemoryCredentialStore::new();
        store.add("u1", "bob", "", "", b"", &emails()).unwrap();
        let new_emails = vec!["bob@example.com".to_string(), "b@example.com".to_string()];

        let (creds, added) = store
            .reactivate("u1", "uid", "ref", b"secret", &new_emails, ("default", "pw"))
            .unwrap();
        assert!(added);
        assert!(creds.is_connected());
        assert_eq!(creds.emails, new_emails);
        assert_eq!(creds.key_slots.get("default"), Some(&password_digest("pw")));

        let (creds, added) = store
            .reactivate("u1", "uid2", "ref2", b"secret", &new_emails, ("default", "other"))
            .unwrap();
        assert!(!added);
        assert_eq!(creds.uid, "uid2");
        assert_eq!(creds.key_slots.get("default"), Some(&password_digest("pw")));
    }

    #[test]
    fn test_logout_clears_session() {
        let store = MemoryCredentialStore::new();
        store.add("u1", "bob", "uid", "ref", b"secret", &emails()).unwrap();

        let creds = store.logout("u1").unwrap();
        assert!(!creds.is_connected());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemoryCredentialStore::new();
        store.add("u1", "bob", "uid", "ref", b"secret", &emails()).unwrap();

        store.delete("u1").unwrap();
        store.delete("u1").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_key_slots() {
        let store = MemoryCredentialStore::new();
        store.add("u1", "bob", "uid", "ref", b"secret", &emails()).unwrap();

        let creds = store.add_key_slot("u1", "laptop", "pw").unwrap();
        assert_eq!(creds.key_slots.get("laptop"), Some(&password_digest("pw")));
        assert_eq!(store.list_key_slots("u1").unwrap(), vec!["laptop".to_string()]);

        store.remove_key_slot("u1", "laptop").unwrap();
        assert!(store.list_key_slots("u1").unwrap().is_empty());
        assert!(matches!(
            store.remove_key_slot("u1", "laptop"),
            Err(CredentialError::KeySlotNotFound { .. })
        ));
    }
}
