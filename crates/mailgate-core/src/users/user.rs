//! Account session.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{debug, info};

use crate::account::keys::password_digest;
use crate::account::{ConnectionStatus, Credentials};
use crate::api::ApiClient;
use crate::events::{CLOSE_CONNECTION_EVENT, Listener};
use crate::store::{Store, StoreMaker};
use crate::{Error, Result};

struct UserState {
    credentials: Credentials,
    status: ConnectionStatus,
    client: Option<Arc<dyn ApiClient>>,
}

/// In-memory session of one account, shared by all of its addresses.
///
/// Exactly one `User` exists per account id; the registry hands out
/// `Arc<User>` clones of it.
pub struct User {
    id: String,
    store_maker: Arc<dyn StoreMaker>,
    listener: Listener,
    state: RwLock<UserState>,
    store: Mutex<Option<Arc<dyn Store>>>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("status", &self.connection_status())
            .finish_non_exhaustive()
    }
}

impl User {
    /// Creates a disconnected session from a persisted record.
    pub(crate) fn new(
        credentials: Credentials,
        store_maker: Arc<dyn StoreMaker>,
        listener: Listener,
    ) -> Self {
        Self {
            id: credentials.user_id.clone(),
            store_maker,
            listener,
            state: RwLock::new(UserState {
                credentials,
                status: ConnectionStatus::Disconnected,
                client: None,
            }),
            store: Mutex::new(None),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&UserState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut UserState) -> T) -> T {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Stable account id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Account name.
    #[must_use]
    pub fn name(&self) -> String {
        self.read(|s| s.credentials.name.clone())
    }

    /// Canonical (lowercased) primary address.
    #[must_use]
    pub fn primary_address(&self) -> String {
        self.read(|s| s.credentials.primary_address())
    }

    /// All addresses, lowercased, primary first.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.read(|s| {
            s.credentials
                .emails
                .iter()
                .map(|e| e.to_lowercase())
                .collect()
        })
    }

    /// Whether `address` (any casing) belongs to this account.
    #[must_use]
    pub fn has_address(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        self.read(|s| {
            s.credentials
                .emails
                .iter()
                .any(|e| e.to_lowercase() == address)
        })
    }

    /// Current connection status.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.read(|s| s.status)
    }

    /// Whether the session is authenticated with the remote service.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    /// Snapshot of the cached credential record.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.read(|s| s.credentials.clone())
    }

    /// API client of the live auth session, if connected.
    #[must_use]
    pub fn client(&self) -> Option<Arc<dyn ApiClient>> {
        self.read(|s| s.client.clone())
    }

    /// Local data store, if it has been opened.
    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn connect(&self, client: Arc<dyn ApiClient>, credentials: Credentials) {
        self.write(|s| {
            s.credentials = credentials;
            s.client = Some(client);
            s.status = ConnectionStatus::Connected;
        });
        debug!(user_id = %self.id, "User connected");
    }

    /// Marks the session disconnected and returns the client it held.
    pub(crate) fn disconnect(&self, credentials: Credentials) -> Option<Arc<dyn ApiClient>> {
        let client = self.write(|s| {
            s.credentials = credentials;
            s.status = ConnectionStatus::Disconnected;
            s.client.take()
        });
        self.close_store();
        client
    }

    pub(crate) fn set_credentials(&self, credentials: Credentials) {
        self.write(|s| s.credentials = credentials);
    }

    pub(crate) fn close_store(&self) {
        if self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!(user_id = %self.id, "Local store closed");
        }
    }

    /// Prepares the session for protocol use, opening the local store once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoggedOut`] if the session is not connected, or a
    /// store error if the local store cannot be opened.
    pub fn bring_online(&self) -> Result<()> {
        let secret = self.read(|s| {
            (s.status == ConnectionStatus::Connected).then(|| s.credentials.mailbox_secret.clone())
        });
        let Some(secret) = secret else {
            return Err(Error::LoggedOut);
        };

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if store.is_none() {
            let key = URL_SAFE_NO_PAD.encode(&secret);
            *store = Some(self.store_maker.open(&self.id, &key)?);
            info!(user_id = %self.id, "Local store opened");
        }
        Ok(())
    }

    /// Verifies gateway credentials for a key slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoggedOut`] if the session is not connected and
    /// [`Error::BadCredentials`] if the slot is unknown or the password
    /// does not match.
    pub fn check_credentials(&self, slot: &str, password: &str) -> Result<()> {
        self.read(|s| {
            if s.status != ConnectionStatus::Connected {
                return Err(Error::LoggedOut);
            }
            match s.credentials.key_slots.get(slot) {
                Some(digest) if *digest == password_digest(password) => Ok(()),
                _ => Err(Error::BadCredentials),
            }
        })
    }

    /// Asks every protocol connection of this account to close.
    pub fn close_all_connections(&self) {
        for address in self.addresses() {
            self.listener.emit(CLOSE_CONNECTION_EVENT, address);
        }
    }
}
