//! Backend session multiplexer.
//!
//! [`ImapBackend`] maps client logins onto account sessions. The cache is
//! keyed by canonical (primary) address, with a secondary alias table, and
//! every lookup or change happens under one lock:
//!
//! ```text
//!   login "Alias@Example.com:slot"
//!     │ decode + lowercase
//!     ▼
//!   aliases["alias@example.com"] ──▶ sessions["primary@example.com"] ──▶ ImapUser
//!     │ miss
//!     ▼
//!   Users::get_user ─▶ bring_online ─▶ canonical address
//!     │ already cached under canonical? reuse, record alias
//!     ▼
//!   new ImapUser, cached under canonical
//! ```
//!
//! Closed-connection events for any address of an account drop the whole
//! cache entry and stop the account's updates. A single connection logging
//! out, or a failed login, only drops the cache entry. The watcher task
//! holding the event subscription only keeps a weak reference to the cache
//! and is aborted with the backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mailgate_core::events::CLOSE_CONNECTION_EVENT;
use mailgate_core::{Listener, Update, Users, decode_login};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::MessageBuilder;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::handler::{Backend, BackendUser};
use crate::updates::ImapUpdates;
use crate::user::ImapUser;

#[derive(Default)]
struct Cache {
    sessions: HashMap<String, Arc<ImapUser>>,
    aliases: HashMap<String, String>,
}

impl Cache {
    fn canonical<'a>(&'a self, address: &'a str) -> &'a str {
        self.aliases.get(address).map_or(address, String::as_str)
    }

    fn get(&self, address: &str) -> Option<Arc<ImapUser>> {
        self.sessions.get(self.canonical(address)).cloned()
    }

    fn remove(&mut self, address: &str) -> Option<Arc<ImapUser>> {
        let canonical = self.canonical(address).to_string();
        let removed = self.sessions.remove(&canonical);
        self.aliases.retain(|_, target| *target != canonical);
        removed
    }
}

/// State shared between the backend, its sessions and the disconnect watcher.
pub(crate) struct Shared {
    users: Arc<Users>,
    pub(crate) config: BackendConfig,
    cache: Mutex<Cache>,
    pub(crate) updates: Arc<ImapUpdates>,
    pub(crate) builder: Arc<MessageBuilder>,
}

impl Shared {
    /// Drops the cache entry of an address and all its aliases. Removing an
    /// address that is not cached is a no-op.
    ///
    /// Connections already holding the session keep it, and its updates
    /// keep flowing.
    pub(crate) async fn evict(&self, address: &str) -> Option<Arc<ImapUser>> {
        let address = address.to_lowercase();
        let removed = self.cache.lock().await.remove(&address);
        match &removed {
            Some(user) => {
                debug!(address = %address, canonical = user.address(), "IMAP user evicted");
            }
            None => debug!(address = %address, "No cached IMAP user to evict"),
        }
        removed
    }

    /// Handles the account behind `address` going away: evicts it and stops
    /// forwarding its updates.
    async fn close_account(&self, address: &str) {
        let user_id = match self.evict(address).await {
            Some(user) => Some(user.user().id().to_string()),
            None => self
                .users
                .get_user(&address.to_lowercase())
                .ok()
                .map(|user| user.id().to_string()),
        };
        if let Some(user_id) = user_id {
            self.updates.deactivate(&user_id);
        }
    }
}

/// IMAP backend multiplexing client logins onto account sessions.
pub struct ImapBackend {
    shared: Arc<Shared>,
    watcher: JoinHandle<()>,
}

impl std::fmt::Debug for ImapBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapBackend")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ImapBackend {
    /// Creates the backend and starts its disconnect watcher and message
    /// builder.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(users: Arc<Users>, listener: &Listener, config: BackendConfig) -> Self {
        let shared = Arc::new(Shared {
            users,
            config,
            cache: Mutex::new(Cache::default()),
            updates: Arc::new(ImapUpdates::new()),
            builder: Arc::new(MessageBuilder::new(config.build_workers)),
        });

        let mut closed = listener.subscribe(CLOSE_CONNECTION_EVENT);
        let cache = Arc::downgrade(&shared);
        let watcher = tokio::spawn(async move {
            while let Some(address) = closed.recv().await {
                let Some(shared) = cache.upgrade() else {
                    break;
                };
                shared.close_account(&address).await;
            }
            debug!("Disconnect watcher stopped");
        });

        info!(
            list_workers = config.list_workers,
            build_workers = config.build_workers,
            "IMAP backend started"
        );
        Self { shared, watcher }
    }

    /// Backend configuration.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    /// Authenticates a client login.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolve`] if the address does not belong to a
    /// connected account, or [`Error::Login`] if the password is wrong. A
    /// wrong password is answered only after the configured delay and leaves
    /// no cached session behind.
    pub async fn login(&self, username: &str, password: &str) -> Result<Arc<ImapUser>> {
        let (address, slot) = decode_login(username);

        let imap_user = self.get_user(&address).await.inspect_err(|e| {
            warn!(address = %address, "Cannot get user: {e}");
        })?;

        if let Err(source) = imap_user.user().check_credentials(&slot, password) {
            error!(address = %address, slot = %slot, "Could not check bridge password: {source}");
            self.shared.evict(&address).await;
            tokio::time::sleep(self.shared.config.bad_login_delay).await;
            return Err(Error::Login { address, source });
        }

        imap_user.attach_notifier();
        info!(address = %address, canonical = imap_user.address(), "IMAP login succeeded");
        Ok(imap_user)
    }

    async fn get_user(&self, address: &str) -> Result<Arc<ImapUser>> {
        let mut cache = self.shared.cache.lock().await;
        if let Some(user) = cache.get(address) {
            return Ok(user);
        }

        debug!(address, "Creating new IMAP user");
        let resolve = |source| Error::Resolve {
            address: address.to_string(),
            source,
        };
        let user = self.shared.users.get_user(address).map_err(resolve)?;
        user.bring_online().map_err(resolve)?;

        let canonical = user.primary_address();
        if canonical != address {
            cache.aliases.insert(address.to_string(), canonical.clone());
        }
        if let Some(existing) = cache.sessions.get(&canonical) {
            return Ok(Arc::clone(existing));
        }

        let imap_user = Arc::new(ImapUser::new(
            user,
            canonical.clone(),
            Arc::downgrade(&self.shared),
        ));
        cache.sessions.insert(canonical, Arc::clone(&imap_user));
        Ok(imap_user)
    }

    /// Whether a login for `address` would be served from the cache.
    pub async fn is_cached(&self, address: &str) -> bool {
        self.shared
            .cache
            .lock()
            .await
            .get(&address.to_lowercase())
            .is_some()
    }

    /// Number of cached account sessions.
    pub async fn session_count(&self) -> usize {
        self.shared.cache.lock().await.sessions.len()
    }
}

impl Drop for ImapBackend {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl Backend for ImapBackend {
    type User = ImapUser;

    async fn login(&self, username: &str, password: &str) -> Result<Arc<ImapUser>> {
        Self::login(self, username, password).await
    }

    fn updates(&self) -> Option<UnboundedReceiver<Update>> {
        self.shared.updates.take_receiver()
    }

    fn create_message_limit(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_remove_by_alias_drops_everything() {
        let mut cache = Cache::default();
        cache
            .aliases
            .insert("alias@example.com".into(), "primary@example.com".into());
        cache
            .aliases
            .insert("other@example.com".into(), "another@example.com".into());

        assert!(cache.remove("alias@example.com").is_none());
        assert_eq!(cache.aliases.len(), 1);
        assert!(cache.remove("alias@example.com").is_none());
        assert_eq!(cache.canonical("other@example.com"), "another@example.com");
        assert_eq!(cache.canonical("plain@example.com"), "plain@example.com");
    }
}
