//! Session registry.
//!
//! [`Users`] owns every [`User`] of the process and drives the login state
//! machine. For a login of account `A`:
//!
//! ```text
//!   no session for A         ──unlock ok──▶ new record + new Connected session
//!   Disconnected session     ──unlock ok──▶ record updated, same session Connected
//!   Connected session        ──unlock ok──▶ AlreadyConnected, new auth revoked
//!   any                      ──unlock err─▶ WrongMailboxPassword, nothing changes
//! ```
//!
//! Everything touching the credential store or the session list for one
//! account runs under that account's login lock, so concurrent logins of the
//! same account are serialized while different accounts proceed in parallel.

mod login;
mod user;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::account::keys::{DEFAULT_KEY_SLOT, mailbox_secret, slot_password};
use crate::account::{CredentialStore, Credentials};
use crate::api::{ApiClient, ApiError, Auth, ClientManager, Profile};
use crate::events::{LOGOUT_EVENT, Listener, USER_DELETED_EVENT};
use crate::store::StoreMaker;
use crate::{Error, Result};

pub use login::{decode_login, encode_login};
pub use user::User;

/// Registry of account sessions.
pub struct Users {
    credentials: Arc<dyn CredentialStore>,
    clients: Arc<dyn ClientManager>,
    store_maker: Arc<dyn StoreMaker>,
    listener: Listener,
    users: RwLock<Vec<Arc<User>>>,
    login_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Users {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Users")
            .field("users", &self.get_users())
            .finish_non_exhaustive()
    }
}

impl Users {
    /// Creates the registry and loads every persisted account.
    ///
    /// Accounts whose record still holds an auth session are resumed through
    /// `clients`; the rest start disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential store cannot be listed.
    pub async fn new(
        credentials: Arc<dyn CredentialStore>,
        clients: Arc<dyn ClientManager>,
        store_maker: Arc<dyn StoreMaker>,
        listener: Listener,
    ) -> Result<Self> {
        let users = Self {
            credentials,
            clients,
            store_maker,
            listener,
            users: RwLock::new(Vec::new()),
            login_locks: Mutex::new(HashMap::new()),
        };

        let ids = users.credentials.list()?;
        debug!(count = ids.len(), "Loading users from credential store");
        for id in ids {
            users.load_user(&id).await;
        }
        Ok(users)
    }

    async fn load_user(&self, user_id: &str) {
        let creds = match self.credentials.get(user_id) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(user_id, "Could not load user credentials: {e}");
                return;
            }
        };

        let user = Arc::new(User::new(
            creds.clone(),
            Arc::clone(&self.store_maker),
            self.listener.clone(),
        ));

        if creds.is_connected() {
            self.resume(&user, &creds).await;
        }

        info!(user_id, status = user.connection_status().display_name(), "User loaded");
        self.write_users().push(user);
    }

    async fn resume(&self, user: &User, creds: &Credentials) {
        let user_id = user.id();
        match self
            .clients
            .client_with_refresh(&creds.uid, &creds.refresh_token)
            .await
        {
            Ok((client, refreshed)) => {
                match self
                    .credentials
                    .update_token(user_id, &refreshed.uid, &refreshed.refresh_token)
                {
                    Ok(updated) => user.connect(client, updated),
                    Err(e) => warn!(user_id, "Could not persist refreshed token: {e}"),
                }
            }
            Err(ApiError::Unauthorized(reason)) => {
                info!(user_id, reason = %reason, "Auth session expired, logging out");
                match self.credentials.logout(user_id) {
                    Ok(updated) => user.set_credentials(updated),
                    Err(e) => warn!(user_id, "Could not log out expired credentials: {e}"),
                }
            }
            Err(e) => warn!(user_id, "Could not resume session, staying disconnected: {e}"),
        }
    }

    fn read_users(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<User>>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_users(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<User>>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn login_lock(&self, user_id: &str) -> LoginGuard<'_> {
        let lock = Arc::clone(
            self.login_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(user_id.to_string())
                .or_default(),
        );
        LoginGuard {
            users: self,
            user_id: user_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Drops the login lock of an account once nobody holds or waits on it.
    fn prune_login_lock(&self, user_id: &str) {
        let mut locks = self
            .login_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks.get(user_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(user_id);
        }
    }

    #[cfg(test)]
    fn login_lock_count(&self) -> usize {
        self.login_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn find(&self, user_id: &str) -> Option<Arc<User>> {
        self.read_users().iter().find(|u| u.id() == user_id).cloned()
    }

    /// Completes a login after the remote service accepted the account password.
    ///
    /// Returns the connected session and, when a new credential record was
    /// created, the derived key string (the password of the default key
    /// slot). Reactivating a known account returns an empty key string.
    ///
    /// # Errors
    ///
    /// - [`Error::WrongMailboxPassword`] if the keys cannot be unlocked.
    /// - [`Error::AlreadyConnected`] if the account already has a connected
    ///   session; the auth session of `client` is revoked first.
    /// - [`Error::Api`] for remote service failures.
    /// - [`Error::Credential`] if the credential record cannot be written;
    ///   the session is then neither registered nor advanced, and the auth
    ///   session of `client` is revoked.
    pub async fn finish_login(
        &self,
        client: Arc<dyn ApiClient>,
        auth: &Auth,
        mailbox_password: &[u8],
        main_key: &str,
    ) -> Result<(Arc<User>, String)> {
        let user_id = auth.user_id.as_str();
        let _guard = self.login_lock(user_id).await;

        let existing = self.find(user_id);
        let (secret, profile) = unlock(client.as_ref(), mailbox_password).await?;
        if profile.id != user_id {
            return Err(Error::AccountMismatch {
                auth: user_id.to_string(),
                profile: profile.id,
            });
        }

        let result = match existing {
            Some(user) if user.is_connected() => {
                warn!(user_id, "Login of already connected user rejected");
                Err(Error::AlreadyConnected)
            }
            Some(user) => self
                .reconnect(&user, Arc::clone(&client), auth, &secret, &profile, main_key)
                .map(|key| {
                    info!(user_id, "Disconnected user logged in again");
                    (user, key)
                }),
            None => self
                .add_user(Arc::clone(&client), auth, &secret, &profile, main_key)
                .inspect(|_| info!(user_id, "New user logged in")),
        };

        if result.is_err() {
            revoke(client.as_ref(), user_id).await;
        }
        result
    }

    fn reconnect(
        &self,
        user: &User,
        client: Arc<dyn ApiClient>,
        auth: &Auth,
        secret: &[u8],
        profile: &Profile,
        main_key: &str,
    ) -> Result<String> {
        let default_key = slot_password(secret, main_key, DEFAULT_KEY_SLOT);
        let (creds, slot_added) = self.credentials.reactivate(
            user.id(),
            &auth.refresh.uid,
            &auth.refresh.refresh_token,
            secret,
            &profile.emails(),
            (DEFAULT_KEY_SLOT, &default_key),
        )?;

        user.connect(client, creds);
        Ok(if slot_added { default_key } else { String::new() })
    }

    fn add_user(
        &self,
        client: Arc<dyn ApiClient>,
        auth: &Auth,
        secret: &[u8],
        profile: &Profile,
        main_key: &str,
    ) -> Result<(Arc<User>, String)> {
        let user_id = auth.user_id.as_str();
        self.credentials.add(
            user_id,
            &profile.name,
            &auth.refresh.uid,
            &auth.refresh.refresh_token,
            secret,
            &profile.emails(),
        )?;

        let key = slot_password(secret, main_key, DEFAULT_KEY_SLOT);
        let creds = match self.credentials.add_key_slot(user_id, DEFAULT_KEY_SLOT, &key) {
            Ok(creds) => creds,
            Err(e) => {
                if let Err(cleanup) = self.credentials.delete(user_id) {
                    warn!(user_id, "Could not remove partial credentials: {cleanup}");
                }
                return Err(e.into());
            }
        };

        let user = Arc::new(User::new(
            creds.clone(),
            Arc::clone(&self.store_maker),
            self.listener.clone(),
        ));
        user.connect(client, creds);
        self.write_users().push(Arc::clone(&user));
        Ok((user, key))
    }

    /// Finds a session by account id or by any of its addresses (any casing).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UserNotFound`] if nothing matches.
    pub fn get_user(&self, query: &str) -> Result<Arc<User>> {
        let users = self.read_users();
        users
            .iter()
            .find(|u| u.id() == query)
            .or_else(|| users.iter().find(|u| u.has_address(query)))
            .cloned()
            .ok_or_else(|| Error::UserNotFound(query.to_string()))
    }

    /// All sessions, in load order.
    #[must_use]
    pub fn get_users(&self) -> Vec<Arc<User>> {
        self.read_users().clone()
    }

    /// Whether a session exists for the account id.
    #[must_use]
    pub fn has_user(&self, user_id: &str) -> bool {
        self.find(user_id).is_some()
    }

    /// Logs an account out: revokes its auth session, clears the persisted
    /// tokens and secret, and closes all of its protocol connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or the record cannot be
    /// written; the session stays connected in the latter case.
    pub async fn logout_user(&self, user_id: &str) -> Result<()> {
        let user = self.find(user_id).ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        let _guard = self.login_lock(user_id).await;
        self.logout_locked(&user).await
    }

    async fn logout_locked(&self, user: &User) -> Result<()> {
        let user_id = user.id();
        let creds = self.credentials.logout(user_id)?;

        if let Some(client) = user.disconnect(creds) {
            if let Err(e) = client.auth_delete().await {
                warn!(user_id, "Could not revoke auth session: {e}");
            }
        }
        user.close_all_connections();
        self.listener.emit(LOGOUT_EVENT, user_id);
        info!(user_id, "User logged out");
        Ok(())
    }

    /// Removes an account from the registry and the credential store.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or its record cannot be
    /// deleted.
    pub async fn delete_user(&self, user_id: &str, clear_store: bool) -> Result<()> {
        let user = self.find(user_id).ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        let _guard = self.login_lock(user_id).await;

        if !user.is_connected() {
            user.close_all_connections();
        } else if let Err(e) = self.logout_locked(&user).await {
            warn!(user_id, "Could not log out user before deletion: {e}");
            user.close_all_connections();
        }
        user.close_store();

        if clear_store {
            if let Err(e) = self.store_maker.remove(user_id) {
                warn!(user_id, "Could not remove local store: {e}");
            }
        }

        self.credentials.delete(user_id)?;
        self.write_users().retain(|u| u.id() != user_id);
        self.listener.emit(USER_DELETED_EVENT, user_id);
        info!(user_id, "User deleted");
        Ok(())
    }

    /// Creates (or re-derives) a key slot and returns its password.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoggedOut`] if the account holds no mailbox secret,
    /// or an error if the record cannot be written.
    pub async fn add_key_slot(&self, user_id: &str, slot: &str, main_key: &str) -> Result<String> {
        let user = self.find(user_id).ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        let _guard = self.login_lock(user_id).await;

        let creds = self.credentials.get(user_id)?;
        if !creds.is_connected() {
            return Err(Error::LoggedOut);
        }

        let password = slot_password(&creds.mailbox_secret, main_key, slot);
        let creds = self.credentials.add_key_slot(user_id, slot, &password)?;
        user.set_credentials(creds);
        debug!(user_id, slot, "Key slot added");
        Ok(password)
    }

    /// Removes a key slot and closes the account's protocol connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the account or slot is unknown.
    pub async fn remove_key_slot(&self, user_id: &str, slot: &str) -> Result<()> {
        let user = self.find(user_id).ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        let _guard = self.login_lock(user_id).await;

        let creds = self.credentials.remove_key_slot(user_id, slot)?;
        user.set_credentials(creds);
        user.close_all_connections();
        debug!(user_id, slot, "Key slot removed");
        Ok(())
    }

    /// Lists the key slots of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the account has no record.
    pub fn list_key_slots(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self.credentials.list_key_slots(user_id)?)
    }
}

/// Hashes the mailbox password, unlocks the keys and fetches the profile.
/// Held login lock of one account.
struct LoginGuard<'a> {
    users: &'a Users,
    user_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.users.prune_login_lock(&self.user_id);
    }
}

async fn revoke(client: &dyn ApiClient, user_id: &str) {
    if let Err(e) = client.auth_delete().await {
        warn!(user_id, "Could not revoke new auth session: {e}");
    }
}

async fn unlock(client: &dyn ApiClient, mailbox_password: &[u8]) -> Result<(Vec<u8>, Profile)> {
    let salt = client.auth_salt().await?;
    let secret = mailbox_secret(&salt, mailbox_password);

    match client.unlock(&secret).await {
        Ok(()) => {}
        Err(ApiError::Unlock(reason)) => {
            debug!(reason = %reason, "Could not unlock user keys");
            return Err(Error::WrongMailboxPassword);
        }
        Err(e) => return Err(e.into()),
    }

    let profile = client.current_user().await?;
    Ok((secret, profile))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::too_many_lines,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::account::keys::password_digest;
    use crate::account::{CredentialError, CredentialResult, MemoryCredentialStore};
    use crate::api::AuthRefresh;
    use crate::events::CLOSE_CONNECTION_EVENT;
    use crate::testing::{MemoryStoreMaker, MockClient, MockClientManager, profile};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const MAIN_KEY: &str = "main-key";
    const MAILBOX: &[u8] = b"mailbox";

    /// Credential store whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryCredentialStore,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
    }

    impl CredentialStore for FlakyStore {
        fn list(&self) -> CredentialResult<Vec<String>> {
            self.inner.list()
        }

        fn get(&self, user_id: &str) -> CredentialResult<Credentials> {
            self.inner.get(user_id)
        }

        fn put(&self, credentials: &Credentials) -> CredentialResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CredentialError::Write("disk full".to_string()));
            }
            self.inner.put(credentials)
        }

        fn delete(&self, user_id: &str) -> CredentialResult<()> {
            self.inner.delete(user_id)
        }
    }

    fn auth(user_id: &str, uid: &str) -> Auth {
        Auth::new(user_id, uid, "acc", format!("ref-{uid}"))
    }

    fn client(user_id: &str, emails: &[&str]) -> Arc<MockClient> {
        Arc::new(MockClient::new().with_profile(profile(user_id, "user", emails)))
    }

    fn persisted(user_id: &str, connected: bool) -> Credentials {
        let secret = mailbox_secret("salt", MAILBOX);
        let mut creds = Credentials::new(
            user_id,
            "user",
            "old-uid",
            "old-ref",
            &secret,
            &["user@example.com".to_string()],
        );
        creds.key_slots.insert(
            DEFAULT_KEY_SLOT.to_string(),
            password_digest(&slot_password(&secret, MAIN_KEY, DEFAULT_KEY_SLOT)),
        );
        if !connected {
            creds.clear_session();
        }
        creds
    }

    async fn empty_registry() -> Users {
        registry(Arc::new(MemoryCredentialStore::new()), MockClientManager::new()).await
    }

    async fn registry(store: Arc<dyn CredentialStore>, clients: MockClientManager) -> Users {
        Users::new(store, Arc::new(clients), MemoryStoreMaker::shared(), Listener::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_finish_login_bad_mailbox_password() {
        let users = empty_registry().await;
        let client = Arc::new(
            MockClient::new()
                .with_mailbox_password(b"something else")
                .with_profile(profile("user-1", "user", &["user@example.com"])),
        );

        let err = users
            .finish_login(client.clone(), &auth("user-1", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::WrongMailboxPassword));
        assert!(users.get_users().is_empty());
        assert_eq!(client.calls(), vec!["auth_salt", "unlock"]);
    }

    #[tokio::test]
    async fn test_finish_login_new_user() {
        let store = Arc::new(MemoryCredentialStore::new());
        let users = registry(store.clone(), MockClientManager::new()).await;
        let client = client("user-1", &["User@Example.com", "alias@example.com"]);

        let (user, key) = users
            .finish_login(client.clone(), &auth("user-1", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap();

        assert_eq!(user.id(), "user-1");
        assert!(user.is_connected());
        assert!(!key.is_empty());
        assert_eq!(users.get_users().len(), 1);

        let creds = store.get("user-1").unwrap();
        assert_eq!(creds.uid, "uid");
        assert_eq!(creds.emails.len(), 2);
        user.check_credentials(DEFAULT_KEY_SLOT, &key).unwrap();
        assert_eq!(client.calls(), vec!["auth_salt", "unlock", "current_user"]);
    }

    #[tokio::test]
    async fn test_finish_login_existing_disconnected_user() {
        let store = Arc::new(MemoryCredentialStore::with_records([persisted("user-1", false)]));
        let users = registry(store.clone(), MockClientManager::new()).await;
        let loaded = users.get_user("user-1").unwrap();
        assert!(!loaded.is_connected());

        let (user, key) = users
            .finish_login(
                client("user-1", &["user@example.com"]),
                &auth("user-1", "new-uid"),
                MAILBOX,
                MAIN_KEY,
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&user, &loaded));
        assert!(user.is_connected());
        assert!(key.is_empty());
        assert_eq!(users.get_users().len(), 1);
        assert_eq!(store.list().unwrap().len(), 1);

        let creds = store.get("user-1").unwrap();
        assert_eq!(creds.uid, "new-uid");
        assert_eq!(creds.refresh_token, "ref-new-uid");
        assert_eq!(creds.mailbox_secret, mailbox_secret("salt", MAILBOX));
    }

    #[tokio::test]
    async fn test_finish_login_connected_user() {
        let store = Arc::new(MemoryCredentialStore::with_records([persisted("user-1", true)]));
        let clients = MockClientManager::new().with_session(
            "old-uid",
            AuthRefresh {
                uid: "old-uid".into(),
                access_token: "acc".into(),
                refresh_token: "refreshed".into(),
            },
        );
        let users = registry(store.clone(), clients).await;
        assert!(users.get_user("user-1").unwrap().is_connected());

        let client = client("user-1", &["user@example.com"]);
        let err = users
            .finish_login(client.clone(), &auth("user-1", "second"), MAILBOX, MAIN_KEY)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "user is already connected");
        assert_eq!(client.auth_delete_count(), 1);
        assert_eq!(
            client.calls(),
            vec!["auth_salt", "unlock", "current_user", "auth_delete"]
        );
        assert_eq!(store.get("user-1").unwrap().uid, "old-uid");
        assert_eq!(users.get_users().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_login_upstream_error_is_propagated() {
        let users = empty_registry().await;
        let client =
            Arc::new(MockClient::new().with_salt_error(ApiError::Network("timeout".into())));

        let err = users
            .finish_login(client, &auth("user-1", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api(ApiError::Network(_))));
        assert!(users.get_users().is_empty());
    }

    #[tokio::test]
    async fn test_finish_login_new_user_write_failure_registers_nothing() {
        let store = Arc::new(FlakyStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let users = registry(store.clone(), MockClientManager::new()).await;
        let client = client("user-1", &["user@example.com"]);

        let err = users
            .finish_login(client.clone(), &auth("user-1", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Credential(_)));
        assert!(users.get_users().is_empty());
        assert!(store.list().unwrap().is_empty());
        assert_eq!(client.auth_delete_count(), 1);
    }

    #[tokio::test]
    async fn test_finish_login_reconnect_write_failure_stays_disconnected() {
        let store = Arc::new(FlakyStore::default());
        store.inner.put(&persisted("user-1", false)).unwrap();
        let users = registry(store.clone(), MockClientManager::new()).await;
        store.fail_writes.store(true, Ordering::SeqCst);
        let client = client("user-1", &["user@example.com"]);

        let err = users
            .finish_login(client.clone(), &auth("user-1", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Persistence);
        let user = users.get_user("user-1").unwrap();
        assert!(!user.is_connected());
        assert!(user.client().is_none());
        assert_eq!(client.auth_delete_count(), 1);

        let creds = store.get("user-1").unwrap();
        assert!(creds.uid.is_empty());
        assert!(creds.mailbox_secret.is_empty());
    }

    #[tokio::test]
    async fn test_finish_login_reconnect_writes_record_once() {
        let store = Arc::new(FlakyStore::default());
        let mut record = persisted("user-1", false);
        record.key_slots.clear();
        store.inner.put(&record).unwrap();
        let users = registry(store.clone(), MockClientManager::new()).await;

        let (user, key) = users
            .finish_login(
                client("user-1", &["user@example.com", "new@example.com"]),
                &auth("user-1", "uid"),
                MAILBOX,
                MAIN_KEY,
            )
            .await
            .unwrap();

        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert!(!key.is_empty());
        user.check_credentials(DEFAULT_KEY_SLOT, &key).unwrap();

        let creds = store.get("user-1").unwrap();
        assert_eq!(creds.uid, "uid");
        assert_eq!(creds.emails.len(), 2);
        assert_eq!(creds.mailbox_secret, mailbox_secret("salt", MAILBOX));
    }

    #[tokio::test]
    async fn test_login_locks_are_released() {
        let users = empty_registry().await;
        let bad = Arc::new(
            MockClient::new()
                .with_mailbox_password(b"something else")
                .with_profile(profile("ghost", "user", &["ghost@example.com"])),
        );
        users
            .finish_login(bad, &auth("ghost", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap_err();
        users
            .finish_login(
                client("user-1", &["user@example.com"]),
                &auth("user-1", "uid"),
                MAILBOX,
                MAIN_KEY,
            )
            .await
            .unwrap();
        assert_eq!(users.login_lock_count(), 0);

        users.add_key_slot("user-1", "phone", MAIN_KEY).await.unwrap();
        users.delete_user("user-1", false).await.unwrap();
        assert_eq!(users.login_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_logins_for_same_account_create_one_session() {
        let store = Arc::new(MemoryCredentialStore::new());
        let users = Arc::new(registry(store.clone(), MockClientManager::new()).await);

        let mut handles = Vec::new();
        for i in 0..4 {
            let users = Arc::clone(&users);
            handles.push(tokio::spawn(async move {
                users
                    .finish_login(
                        client("user-1", &["user@example.com"]),
                        &auth("user-1", &format!("uid-{i}")),
                        MAILBOX,
                        MAIN_KEY,
                    )
                    .await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::AlreadyConnected) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(conflicts, 3);
        assert_eq!(users.get_users().len(), 1);
    }

    #[tokio::test]
    async fn test_logins_for_different_accounts_are_independent() {
        let users = Arc::new(empty_registry().await);

        let a = {
            let users = Arc::clone(&users);
            tokio::spawn(async move {
                users
                    .finish_login(
                        client("a", &["a@example.com"]),
                        &auth("a", "ua"),
                        MAILBOX,
                        MAIN_KEY,
                    )
                    .await
            })
        };
        let b = {
            let users = Arc::clone(&users);
            tokio::spawn(async move {
                users
                    .finish_login(
                        client("b", &["b@example.com"]),
                        &auth("b", "ub"),
                        MAILBOX,
                        MAIN_KEY,
                    )
                    .await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(users.get_users().len(), 2);
        assert_eq!(users.get_user("B@EXAMPLE.COM").unwrap().id(), "b");
    }

    #[tokio::test]
    async fn test_startup_with_expired_session_logs_out_record() {
        let store = Arc::new(MemoryCredentialStore::with_records([persisted("user-1", true)]));
        let users = registry(store.clone(), MockClientManager::new()).await;

        let user = users.get_user("user@example.com").unwrap();
        assert!(!user.is_connected());
        assert!(!store.get("user-1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_startup_with_network_error_keeps_record() {
        let store = Arc::new(MemoryCredentialStore::with_records([persisted("user-1", true)]));
        let clients =
            MockClientManager::new().with_error("old-uid", ApiError::Network("down".into()));
        let users = registry(store.clone(), clients).await;

        assert!(!users.get_user("user-1").unwrap().is_connected());
        assert!(store.get("user-1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_logout_user_emits_close_events() {
        let listener = Listener::new();
        let mut closed = listener.subscribe(CLOSE_CONNECTION_EVENT);
        let store = Arc::new(MemoryCredentialStore::new());
        let users = Users::new(
            store.clone(),
            Arc::new(MockClientManager::new()),
            MemoryStoreMaker::shared(),
            listener,
        )
        .await
        .unwrap();
        let client = client("user-1", &["user@example.com", "alias@example.com"]);
        users
            .finish_login(client.clone(), &auth("user-1", "uid"), MAILBOX, MAIN_KEY)
            .await
            .unwrap();

        users.logout_user("user-1").await.unwrap();

        assert!(!users.get_user("user-1").unwrap().is_connected());
        assert!(!store.get("user-1").unwrap().is_connected());
        assert_eq!(client.auth_delete_count(), 1);
        assert_eq!(closed.recv().await.unwrap(), "user@example.com");
        assert_eq!(closed.recv().await.unwrap(), "alias@example.com");
    }

    #[tokio::test]
    async fn test_delete_user_removes_everything() {
        let store = Arc::new(MemoryCredentialStore::new());
        let maker = MemoryStoreMaker::shared();
        let users = Users::new(
            store.clone(),
            Arc::new(MockClientManager::new()),
            maker.clone(),
            Listener::new(),
        )
        .await
        .unwrap();
        users
            .finish_login(
                client("user-1", &["user@example.com"]),
                &auth("user-1", "uid"),
                MAILBOX,
                MAIN_KEY,
            )
            .await
            .unwrap();

        users.delete_user("user-1", true).await.unwrap();

        assert!(!users.has_user("user-1"));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(maker.removed(), vec!["user-1".to_string()]);
        assert!(matches!(users.get_user("user-1"), Err(Error::UserNotFound(_))));
    }

    #[tokio::test]
    async fn test_key_slots() {
        let users = empty_registry().await;
        let (user, _) = users
            .finish_login(
                client("user-1", &["user@example.com"]),
                &auth("user-1", "uid"),
                MAILBOX,
                MAIN_KEY,
            )
            .await
            .unwrap();

        let password = users.add_key_slot("user-1", "phone", MAIN_KEY).await.unwrap();
        user.check_credentials("phone", &password).unwrap();
        assert_eq!(users.list_key_slots("user-1").unwrap().len(), 2);

        users.remove_key_slot("user-1", "phone").await.unwrap();
        assert!(matches!(
            user.check_credentials("phone", &password),
            Err(Error::BadCredentials)
        ));
    }
}
