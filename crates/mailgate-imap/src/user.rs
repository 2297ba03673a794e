//! IMAP view of an account session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mailgate_core::{ChangeNotifier, Store, User};
use tracing::{debug, info};

use crate::backend::Shared;
use crate::error::{Error, Result};
use crate::fetch::FetchPool;
use crate::handler::{BackendUser, FetchItem, FetchedMessage};

/// Protocol session wrapper shared by every connection of one account.
///
/// The backend keeps one `ImapUser` per canonical address; all aliases of
/// the account resolve to it.
pub struct ImapUser {
    user: Arc<User>,
    address: String,
    backend: Weak<Shared>,
    notifier_attached: AtomicBool,
}

impl std::fmt::Debug for ImapUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapUser")
            .field("address", &self.address)
            .field("user", &self.user.id())
            .finish_non_exhaustive()
    }
}

impl ImapUser {
    pub(crate) fn new(user: Arc<User>, address: String, backend: Weak<Shared>) -> Self {
        Self {
            user,
            address,
            backend,
            notifier_attached: AtomicBool::new(false),
        }
    }

    /// The account session.
    #[must_use]
    pub const fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Canonical (primary) address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the update notifier has been attached to the local store.
    #[must_use]
    pub fn is_notifier_attached(&self) -> bool {
        self.notifier_attached.load(Ordering::SeqCst)
    }

    /// Hooks the account's local store to the backend update stream.
    /// Only the first call has an effect.
    pub(crate) fn attach_notifier(&self) {
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        let Some(store) = self.user.store() else {
            return;
        };
        if self.notifier_attached.swap(true, Ordering::SeqCst) {
            return;
        }

        backend.updates.activate(self.user.id());
        let notifier: Arc<dyn ChangeNotifier> = backend.updates.clone();
        store.set_change_notifier(notifier);
        debug!(address = %self.address, "Change notifier attached");
    }

    fn store(&self) -> Result<Arc<dyn Store>> {
        self.user
            .store()
            .ok_or_else(|| Error::NoStore(self.user.id().to_string()))
    }
}

#[async_trait]
impl BackendUser for ImapUser {
    fn username(&self) -> &str {
        &self.address
    }

    async fn logout(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.evict(&self.address).await;
        }
        info!(address = %self.address, "IMAP user logged out");
    }

    async fn fetch_messages(
        &self,
        ids: Vec<String>,
        items: &[FetchItem],
    ) -> Result<Vec<(String, Result<FetchedMessage>)>> {
        let backend = self.backend.upgrade().ok_or(Error::BuilderClosed)?;
        let store = self.store()?;
        let builder = Arc::clone(&backend.builder);
        let pool = FetchPool::new(backend.config.list_workers);
        drop(backend);

        let items = items.to_vec();
        let results = pool
            .run(ids, move |id| {
                let store = Arc::clone(&store);
                let builder = Arc::clone(&builder);
                let items = items.clone();
                async move {
                    let meta = store.message(&id).await?;
                    let mut message = FetchedMessage {
                        id: id.clone(),
                        ..FetchedMessage::default()
                    };
                    for item in items {
                        match item {
                            FetchItem::Flags => message.flags = Some(meta.flags.clone()),
                            FetchItem::Size => message.size = Some(meta.size),
                            FetchItem::Literal => {
                                let literal = builder.build(Arc::clone(&store), &id).await?;
                                message.literal = Some(literal);
                            }
                        }
                    }
                    Ok(message)
                }
            })
            .await;
        Ok(results)
    }
}
