//! Integration tests for the IMAP backend.
//!
//! These tests run a real session registry on in-memory credentials, a
//! scripted API client and in-memory local stores.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use mailgate_core::events::CLOSE_CONNECTION_EVENT;
use mailgate_core::testing::{MemoryStore, MemoryStoreMaker, MockClient, MockClientManager, profile};
use mailgate_core::{Auth, Listener, MemoryCredentialStore, StoreError, Update, Users};
use mailgate_imap::{Backend, BackendConfig, BackendUser, Error, FetchItem, ImapBackend};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

const USER_ID: &str = "user-1";
const PRIMARY: &str = "alice@example.com";
const ALIAS: &str = "Alias@Example.org";
const MAIN_KEY: &str = "main-key";

struct Harness {
    backend: Arc<ImapBackend>,
    users: Arc<Users>,
    listener: Listener,
    stores: Arc<MemoryStoreMaker>,
    password: String,
}

impl Harness {
    async fn new(config: BackendConfig) -> Self {
        init_tracing();

        let listener = Listener::new();
        let stores = MemoryStoreMaker::shared();
        let users = Arc::new(
            Users::new(
                Arc::new(MemoryCredentialStore::new()),
                Arc::new(MockClientManager::new()),
                stores.clone(),
                listener.clone(),
            )
            .await
            .unwrap(),
        );

        let client = Arc::new(MockClient::new().with_profile(profile(
            USER_ID,
            "alice",
            &[PRIMARY, ALIAS],
        )));
        let (_, password) = users
            .finish_login(
                client,
                &Auth::new(USER_ID, "uid", "access", "refresh"),
                b"mailbox",
                MAIN_KEY,
            )
            .await
            .unwrap();

        let backend = Arc::new(ImapBackend::new(users.clone(), &listener, config));
        Self {
            backend,
            users,
            listener,
            stores,
            password,
        }
    }

    async fn quick() -> Self {
        Self::new(BackendConfig::default().bad_login_delay(Duration::ZERO)).await
    }

    fn store(&self) -> Arc<MemoryStore> {
        self.stores.store(USER_ID)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Lets spawned tasks (the disconnect watcher) run.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn expunge(seq: u32) -> Update {
    Update::Expunge {
        user_id: USER_ID.to_string(),
        mailbox: "INBOX".to_string(),
        seq,
    }
}

#[tokio::test]
async fn test_login_with_any_casing_returns_same_session() {
    let h = Harness::quick().await;

    let first = h.backend.login(PRIMARY, &h.password).await.unwrap();
    let second = h
        .backend
        .login("ALICE@Example.COM", &h.password)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.username(), PRIMARY);
    assert_eq!(h.backend.session_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_alias_logins_share_one_session() {
    let h = Harness::quick().await;

    let mut logins = tokio::task::JoinSet::new();
    for i in 0..16 {
        let backend = Arc::clone(&h.backend);
        let password = h.password.clone();
        let username = match i % 4 {
            0 => PRIMARY.to_string(),
            1 => ALIAS.to_string(),
            2 => ALIAS.to_uppercase(),
            _ => PRIMARY.to_uppercase(),
        };
        logins.spawn(async move { backend.login(&username, &password).await });
    }

    let mut sessions = Vec::new();
    while let Some(result) = logins.join_next().await {
        sessions.push(result.unwrap().unwrap());
    }

    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s.user(), sessions[0].user())));
    assert_eq!(h.backend.session_count().await, 1);
    assert!(h.backend.is_cached(PRIMARY).await);
    assert!(h.backend.is_cached(ALIAS).await);
    assert_eq!(h.users.get_users().len(), 1);
}

#[tokio::test]
async fn test_close_connection_eviction_is_idempotent() {
    let h = Harness::quick().await;
    let before = h.backend.login(ALIAS, &h.password).await.unwrap();
    assert!(h.backend.is_cached(PRIMARY).await);

    h.listener.emit(CLOSE_CONNECTION_EVENT, PRIMARY);
    settle().await;
    assert_eq!(h.backend.session_count().await, 0);
    assert!(!h.backend.is_cached(ALIAS).await);

    h.listener.emit(CLOSE_CONNECTION_EVENT, PRIMARY);
    h.listener.emit(CLOSE_CONNECTION_EVENT, ALIAS);
    settle().await;
    assert_eq!(h.backend.session_count().await, 0);

    let after = h.backend.login(ALIAS, &h.password).await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(Arc::ptr_eq(before.user(), after.user()));
    assert_eq!(h.backend.session_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_bad_password_is_throttled_and_not_cached() {
    let h = Harness::new(BackendConfig::default()).await;

    let start = Instant::now();
    let err = h.backend.login(PRIMARY, "wrong").await.unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(matches!(
        err,
        Error::Login {
            source: mailgate_core::Error::BadCredentials,
            ..
        }
    ));
    assert_eq!(h.backend.session_count().await, 0);
    assert!(!h.backend.is_cached(PRIMARY).await);
    assert!(h.users.get_user(USER_ID).unwrap().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_bad_password_evicts_existing_session() {
    let h = Harness::new(BackendConfig::default()).await;
    h.backend.login(PRIMARY, &h.password).await.unwrap();

    h.backend.login(ALIAS, "wrong").await.unwrap_err();

    assert_eq!(h.backend.session_count().await, 0);
    assert!(!h.backend.is_cached(ALIAS).await);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_address_fails_without_delay() {
    let h = Harness::new(BackendConfig::default()).await;

    let start = Instant::now();
    let err = h.backend.login("nobody@example.com", "x").await.unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        err.core(),
        Some(mailgate_core::Error::UserNotFound(_))
    ));
    assert_eq!(h.backend.session_count().await, 0);
}

#[tokio::test]
async fn test_login_with_key_slot() {
    let h = Harness::quick().await;
    let phone = h.users.add_key_slot(USER_ID, "phone", MAIN_KEY).await.unwrap();

    h.backend
        .login(&format!("{PRIMARY}:phone"), &phone)
        .await
        .unwrap();
    let err = h
        .backend
        .login(&format!("{PRIMARY}:phone"), &h.password)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Login { .. }));
}

#[tokio::test]
async fn test_logged_out_user_cannot_log_in() {
    let h = Harness::quick().await;
    h.backend.login(PRIMARY, &h.password).await.unwrap();

    h.users.logout_user(USER_ID).await.unwrap();
    settle().await;
    assert_eq!(h.backend.session_count().await, 0);

    let err = h.backend.login(PRIMARY, &h.password).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Resolve {
            source: mailgate_core::Error::LoggedOut,
            ..
        }
    ));
}

#[tokio::test]
async fn test_notifier_is_attached_once() {
    let h = Harness::quick().await;

    let user = h.backend.login(PRIMARY, &h.password).await.unwrap();
    h.backend.login(ALIAS, &h.password).await.unwrap();
    h.backend.login(PRIMARY, &h.password).await.unwrap();

    assert!(user.is_notifier_attached());
    assert_eq!(h.store().notifier_set_count(), 1);
    assert_eq!(h.stores.open_count(), 1);
}

#[tokio::test]
async fn test_updates_stream_preserves_order() {
    let h = Harness::quick().await;
    let mut updates = h.backend.updates().unwrap();
    assert!(h.backend.updates().is_none());

    h.backend.login(PRIMARY, &h.password).await.unwrap();
    let store = h.store();
    for seq in 1..=3 {
        store.emit(expunge(seq));
    }

    for seq in 1..=3 {
        assert_eq!(updates.recv().await.unwrap(), expunge(seq));
    }
}

#[tokio::test]
async fn test_updates_stop_after_eviction() {
    let h = Harness::quick().await;
    let mut updates = h.backend.updates().unwrap();
    h.backend.login(PRIMARY, &h.password).await.unwrap();

    h.listener.emit(CLOSE_CONNECTION_EVENT, PRIMARY);
    settle().await;
    h.store().emit(expunge(1));

    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn test_updates_survive_other_connection_logout() {
    let h = Harness::quick().await;
    let mut updates = h.backend.updates().unwrap();
    let conn_a = h.backend.login(PRIMARY, &h.password).await.unwrap();
    let conn_b = h.backend.login(ALIAS, &h.password).await.unwrap();

    conn_b.logout().await;
    assert_eq!(h.backend.session_count().await, 0);
    h.store().emit(expunge(1));

    assert_eq!(updates.try_recv().unwrap(), expunge(1));
    assert!(conn_a.is_notifier_attached());
}

#[tokio::test]
async fn test_updates_survive_bad_password_on_alias() {
    let h = Harness::quick().await;
    let mut updates = h.backend.updates().unwrap();
    let _conn_a = h.backend.login(PRIMARY, &h.password).await.unwrap();

    h.backend.login(ALIAS, "wrong").await.unwrap_err();
    h.store().emit(expunge(1));

    assert_eq!(updates.try_recv().unwrap(), expunge(1));
}

#[tokio::test]
async fn test_account_logout_stops_updates_of_uncached_session() {
    let h = Harness::quick().await;
    let mut updates = h.backend.updates().unwrap();
    let conn = h.backend.login(PRIMARY, &h.password).await.unwrap();
    let store = h.store();
    conn.logout().await;

    h.users.logout_user(USER_ID).await.unwrap();
    settle().await;
    store.emit(expunge(1));

    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn test_fetch_failure_is_isolated_per_item() {
    let h = Harness::quick().await;
    let user = h.backend.login(PRIMARY, &h.password).await.unwrap();
    let store = h.store();
    store.insert_message("m1", &["\\Seen"], "Subject: one\r\n\r\nfirst");
    store.insert_message("m2", &[], "Subject: two\r\n\r\nsecond");
    store.insert_message("m3", &["\\Flagged"], "Subject: three\r\n\r\nthird");
    store.break_message("m2");

    let results = user
        .fetch_messages(
            vec!["m1".into(), "m2".into(), "m3".into(), "missing".into()],
            &[FetchItem::Flags, FetchItem::Size, FetchItem::Literal],
        )
        .await
        .unwrap();

    let ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "missing"]);

    let m1 = results[0].1.as_ref().unwrap();
    assert_eq!(m1.flags.as_deref(), Some(&["\\Seen".to_string()][..]));
    assert_eq!(m1.size, Some(21));
    assert!(m1.literal.as_ref().unwrap().ends_with(b"first"));

    assert!(matches!(
        results[1].1,
        Err(Error::Store(StoreError::Build { .. }))
    ));
    assert!(results[2].1.as_ref().unwrap().literal.is_some());
    assert!(matches!(
        results[3].1,
        Err(Error::Store(StoreError::MessageNotFound(_)))
    ));
}

#[tokio::test]
async fn test_fetch_without_literal_skips_builder() {
    let h = Harness::quick().await;
    let user = h.backend.login(PRIMARY, &h.password).await.unwrap();
    let store = h.store();
    store.insert_message("m1", &[], "body");

    let results = user
        .fetch_messages(vec!["m1".into()], &[FetchItem::Size])
        .await
        .unwrap();

    let message = results[0].1.as_ref().unwrap();
    assert_eq!(message.size, Some(4));
    assert!(message.flags.is_none());
    assert!(message.literal.is_none());
    assert_eq!(store.build_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_builder_caps_builds_across_requests() {
    let h = Harness::new(
        BackendConfig::default()
            .list_workers(8)
            .build_workers(2)
            .bad_login_delay(Duration::ZERO),
    )
    .await;
    let user = h.backend.login(PRIMARY, &h.password).await.unwrap();
    let store = h.store();
    store.set_build_delay(Duration::from_millis(20));
    let ids: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    for id in &ids {
        store.insert_message(id, &[], "body");
    }

    let mut requests = tokio::task::JoinSet::new();
    for _ in 0..3 {
        let user = Arc::clone(&user);
        let ids = ids.clone();
        requests.spawn(async move { user.fetch_messages(ids, &[FetchItem::Literal]).await });
    }
    while let Some(result) = requests.join_next().await {
        let results = result.unwrap().unwrap();
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    assert_eq!(store.build_count(), 30);
    assert_eq!(store.max_concurrent_builds(), 2);
}

#[tokio::test]
async fn test_backend_contract() {
    let h = Harness::quick().await;
    assert_eq!(h.backend.create_message_limit(), None);
    assert_eq!(h.backend.config().bad_login_delay, Duration::ZERO);

    let user = Backend::login(h.backend.as_ref(), PRIMARY, &h.password)
        .await
        .unwrap();
    user.logout().await;
    assert_eq!(h.backend.session_count().await, 0);
}

#[tokio::test]
async fn test_dropping_backend_stops_watcher() {
    let h = Harness::quick().await;
    assert_eq!(h.listener.subscriber_count(CLOSE_CONNECTION_EVENT), 1);

    let Harness {
        backend, listener, ..
    } = h;
    drop(backend);
    settle().await;

    assert_eq!(listener.subscriber_count(CLOSE_CONNECTION_EVENT), 0);
}
