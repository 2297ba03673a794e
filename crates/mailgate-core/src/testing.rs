//! In-process test doubles for the remote service and local store.
//!
//! Compiled for this crate's tests and for dependents that enable the
//! `testing` feature.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::account::keys::mailbox_secret;
use crate::api::{Address, ApiClient, ApiError, ApiResult, AuthRefresh, ClientManager, Profile};
use crate::store::{ChangeNotifier, MessageMeta, Store, StoreError, StoreMaker, StoreResult, Update};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a profile whose first address is primary.
#[must_use]
pub fn profile(id: &str, name: &str, emails: &[&str]) -> Profile {
    Profile {
        id: id.to_string(),
        name: name.to_string(),
        addresses: emails
            .iter()
            .enumerate()
            .map(|(i, email)| Address {
                id: format!("{id}-addr-{i}"),
                email: (*email).to_string(),
            })
            .collect(),
    }
}

/// Scriptable API client that records the calls it receives.
#[derive(Debug)]
pub struct MockClient {
    salt: String,
    mailbox_password: Vec<u8>,
    profile: Option<Profile>,
    salt_error: Option<ApiError>,
    calls: Mutex<Vec<&'static str>>,
    auth_deletes: AtomicUsize,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    /// Client accepting the mailbox password `"mailbox"` and no profile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            salt: "salt".to_string(),
            mailbox_password: b"mailbox".to_vec(),
            profile: None,
            salt_error: None,
            calls: Mutex::new(Vec::new()),
            auth_deletes: AtomicUsize::new(0),
        }
    }

    /// Sets the profile returned by `current_user`.
    #[must_use]
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Sets the mailbox password that unlocks the keys.
    #[must_use]
    pub fn with_mailbox_password(mut self, password: &[u8]) -> Self {
        self.mailbox_password = password.to_vec();
        self
    }

    /// Makes `auth_salt` fail.
    #[must_use]
    pub fn with_salt_error(mut self, error: ApiError) -> Self {
        self.salt_error = Some(error);
        self
    }

    /// Names of the calls received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    /// Number of `auth_delete` calls.
    #[must_use]
    pub fn auth_delete_count(&self) -> usize {
        self.auth_deletes.load(Ordering::SeqCst)
    }

    fn record(&self, call: &'static str) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl ApiClient for MockClient {
    async fn auth_salt(&self) -> ApiResult<String> {
        self.record("auth_salt");
        match &self.salt_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.salt.clone()),
        }
    }

    async fn unlock(&self, passphrase: &[u8]) -> ApiResult<()> {
        self.record("unlock");
        if passphrase == mailbox_secret(&self.salt, &self.mailbox_password).as_slice() {
            Ok(())
        } else {
            Err(ApiError::Unlock("no keys could be unlocked".to_string()))
        }
    }

    async fn current_user(&self) -> ApiResult<Profile> {
        self.record("current_user");
        self.profile
            .clone()
            .ok_or_else(|| ApiError::Protocol("no profile".to_string()))
    }

    async fn auth_delete(&self) -> ApiResult<()> {
        self.record("auth_delete");
        self.auth_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Client manager resuming sessions from a scripted table.
///
/// Unknown auth session ids are rejected as unauthorized.
#[derive(Debug, Default)]
pub struct MockClientManager {
    sessions: Mutex<HashMap<String, ApiResult<AuthRefresh>>>,
}

impl MockClientManager {
    /// Creates a manager that rejects every session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resuming `uid` succeeds with the refreshed tokens.
    #[must_use]
    pub fn with_session(self, uid: &str, refreshed: AuthRefresh) -> Self {
        lock(&self.sessions).insert(uid.to_string(), Ok(refreshed));
        self
    }

    /// Resuming `uid` fails with `error`.
    #[must_use]
    pub fn with_error(self, uid: &str, error: ApiError) -> Self {
        lock(&self.sessions).insert(uid.to_string(), Err(error));
        self
    }
}

#[async_trait]
impl ClientManager for MockClientManager {
    async fn client_with_refresh(
        &self,
        uid: &str,
        _refresh_token: &str,
    ) -> ApiResult<(Arc<dyn ApiClient>, AuthRefresh)> {
        let result = lock(&self.sessions)
            .get(uid)
            .cloned()
            .unwrap_or_else(|| Err(ApiError::Unauthorized(format!("unknown session {uid}"))));
        let refreshed = result?;
        let client: Arc<dyn ApiClient> = Arc::new(MockClient::new());
        Ok((client, refreshed))
    }
}

/// In-memory local store.
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<HashMap<String, (MessageMeta, Bytes)>>,
    broken: Mutex<HashSet<String>>,
    notifier: Mutex<Option<Arc<dyn ChangeNotifier>>>,
    notifier_sets: AtomicUsize,
    build_delay: Mutex<Duration>,
    building: AtomicUsize,
    max_building: AtomicUsize,
    builds: AtomicUsize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("messages", &lock(&self.messages).len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Adds a message.
    pub fn insert_message(&self, id: &str, flags: &[&str], body: &str) {
        let meta = MessageMeta {
            id: id.to_string(),
            flags: flags.iter().map(|f| (*f).to_string()).collect(),
            size: u32::try_from(body.len()).unwrap_or(u32::MAX),
        };
        lock(&self.messages).insert(id.to_string(), (meta, Bytes::from(body.to_string())));
    }

    /// Makes building the literal of `id` fail.
    pub fn break_message(&self, id: &str) {
        lock(&self.broken).insert(id.to_string());
    }

    /// Makes every build take `delay`.
    pub fn set_build_delay(&self, delay: Duration) {
        *lock(&self.build_delay) = delay;
    }

    /// Sends an update to the installed notifier, if any.
    pub fn emit(&self, update: Update) {
        let notifier = lock(&self.notifier).clone();
        if let Some(notifier) = notifier {
            notifier.notify(update);
        }
    }

    /// How many times a change notifier was installed.
    #[must_use]
    pub fn notifier_set_count(&self) -> usize {
        self.notifier_sets.load(Ordering::SeqCst)
    }

    /// Highest number of builds observed running at once.
    #[must_use]
    pub fn max_concurrent_builds(&self) -> usize {
        self.max_building.load(Ordering::SeqCst)
    }

    /// Number of builds that ran to completion or failure.
    #[must_use]
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn set_change_notifier(&self, notifier: Arc<dyn ChangeNotifier>) {
        *lock(&self.notifier) = Some(notifier);
        self.notifier_sets.fetch_add(1, Ordering::SeqCst);
    }

    async fn message(&self, id: &str) -> StoreResult<MessageMeta> {
        lock(&self.messages)
            .get(id)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| StoreError::MessageNotFound(id.to_string()))
    }

    async fn build_literal(&self, id: &str) -> StoreResult<Bytes> {
        let running = self.building.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_building.fetch_max(running, Ordering::SeqCst);

        let delay = *lock(&self.build_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if lock(&self.broken).contains(id) {
            Err(StoreError::Build {
                id: id.to_string(),
                reason: "corrupt message".to_string(),
            })
        } else {
            lock(&self.messages)
                .get(id)
                .map(|(_, body)| body.clone())
                .ok_or_else(|| StoreError::MessageNotFound(id.to_string()))
        };

        self.building.fetch_sub(1, Ordering::SeqCst);
        self.builds.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Store maker handing out one [`MemoryStore`] per account.
#[derive(Debug, Default)]
pub struct MemoryStoreMaker {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
    opens: AtomicUsize,
    removed: Mutex<Vec<String>>,
}

impl MemoryStoreMaker {
    /// Creates a shared maker.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The store of an account, creating it if needed.
    #[must_use]
    pub fn store(&self, user_id: &str) -> Arc<MemoryStore> {
        Arc::clone(lock(&self.stores).entry(user_id.to_string()).or_default())
    }

    /// Number of `open` calls.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Accounts whose data was removed.
    #[must_use]
    pub fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }
}

impl StoreMaker for MemoryStoreMaker {
    fn open(&self, user_id: &str, key: &str) -> StoreResult<Arc<dyn Store>> {
        if key.is_empty() {
            return Err(StoreError::Unavailable("empty store key".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let store: Arc<dyn Store> = self.store(user_id);
        Ok(store)
    }

    fn remove(&self, user_id: &str) -> StoreResult<()> {
        lock(&self.stores).remove(user_id);
        lock(&self.removed).push(user_id.to_string());
        Ok(())
    }
}
