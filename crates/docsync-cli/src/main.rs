//! docsync - mirror an in-memory document store and log its change feeds.
//!
//! The demo seeds a few users and notifications, binds collection caches to
//! them, resolves one user's friends through the users cache, then makes a
//! handful of writes so every feed has something to report.

mod models;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docsync_core::store::{CollectionRef, MemoryStore, WriteBatch};
use docsync_core::{
    CacheEvent, CollectionSync, CompletionPolicy, Document, SyncConfig, SyncContext,
};

use models::{Notification, User};

/// Pause between demo writes so each change feed is logged on its own.
const STEP_DELAY_MS: u64 = 50;

/// Environment variable naming an explicit config file
const CONFIG_ENV: &str = "DOCSYNC_CONFIG";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn load_config() -> Result<SyncConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            SyncConfig::load_from(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))
        }
        None => SyncConfig::load().context("Failed to load config"),
    }
}

fn seed(store: &MemoryStore, users: &CollectionRef, notifications: &CollectionRef) {
    store.seed(
        users.doc("alice"),
        json!({
            "name": "Alice",
            "email": "alice@example.com",
            "friends": ["users/bob", "users/carol"],
        }),
    );
    store.seed(users.doc("bob"), json!({"name": "Bob", "email": "bob@example.com"}));
    store.seed(users.doc("carol"), json!({"name": "Carol", "email": "carol@example.com"}));
    store.seed(users.doc("dave"), json!({"name": "Dave", "email": "dave@example.com"}));
    store.seed(
        notifications.doc("welcome"),
        json!({"user": "users/alice", "message": "Welcome aboard"}),
    );
}

/// Log every change a cache reports.
fn log_events<T: Document>(label: &'static str) -> impl Fn(&CacheEvent<T>) + Send + Sync + 'static {
    move |event: &CacheEvent<T>| match event {
        CacheEvent::Inserted { position, entity } => {
            info!(cache = label, position, id = ?entity.id(), "Inserted")
        }
        CacheEvent::Changed { position, entity } => {
            info!(cache = label, position, id = ?entity.id(), "Changed")
        }
        CacheEvent::Removed { position, entity } => {
            info!(cache = label, position, id = ?entity.id(), "Removed")
        }
        CacheEvent::Replaced { entities } => {
            info!(cache = label, size = entities.len(), "Replaced")
        }
        CacheEvent::SizeChanged { .. } => {}
    }
}

async fn step() {
    tokio::time::sleep(Duration::from_millis(STEP_DELAY_MS)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    info!("docsync demo starting");

    let config = load_config()?;
    let wait = config.wait_timeout();
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(store.clone(), config);
    ctx.register_serde::<User>();
    ctx.register_serde::<Notification>();

    let users_ref = CollectionRef::new("users");
    let notifications_ref = CollectionRef::new("notifications");
    seed(&store, &users_ref, &notifications_ref);

    let users = CollectionSync::<User>::listen(&ctx, users_ref.clone(), None)?;
    ctx.register_collection("users", users.clone());
    let _users_log = users.add_listener(log_events("users"));

    let (ready_tx, ready_rx) = oneshot::channel();
    users.on_ready(move |cache| {
        let _ = ready_tx.send(cache.len());
    });
    let loaded = tokio::time::timeout(wait, ready_rx)
        .await
        .context("Users never became ready")?
        .context("Users cache went away")?;
    info!(loaded, "Users ready");

    let alice = users.wait_get("alice").await?;
    let friends = User::attach_friends(&alice, &users);
    let _friends_log = friends.add_listener(log_events("friends"));
    let _friends_complete = friends.on_complete(CompletionPolicy::EveryUpdate, |cache| {
        let names: Vec<String> = cache.snapshot().into_iter().map(|u| u.name).collect();
        info!(friends = ?names, "Friends resolved");
    });

    let alice_query = notifications_ref
        .query()
        .where_eq("user", users_ref.doc("alice").path());
    let inbox = CollectionSync::<Notification>::listen(&ctx, notifications_ref, Some(alice_query))?;
    let _inbox_log = inbox.add_listener(log_events("inbox"));

    // Alice makes a new friend and gets told about it.
    let mut batch = WriteBatch::new();
    let mut fields = Map::new();
    fields.insert("friends".to_string(), json!(["users/bob", "users/carol", "users/dave"]));
    alice.send_update(fields, Some(&mut batch)).await?;
    inbox
        .create(
            &Notification {
                user: Some(users_ref.doc("alice")),
                message: "Dave is now your friend".to_string(),
                read: false,
            },
            None,
            Some(&mut batch),
        )
        .await?;
    ctx.store().commit(batch).await?;
    step().await;

    // Carol leaves.
    users.delete("carol", None).await?;
    step().await;

    match users.request_get("bob").await {
        Ok(bob) => info!(id = ?bob.id(), "Bob served from cache"),
        Err(e) => warn!(error = %e, "Could not get Bob"),
    }
    let unread = inbox.query_get(|q| q.where_eq("read", false)).await?;
    info!(unread = unread.len(), "Unread notifications");

    let summary = json!({
        "users": users.ids(),
        "friends_of_alice": friends.ids(),
        "friends_ready": friends.is_ready(),
        "inbox": inbox
            .snapshot()
            .into_iter()
            .map(|n| n.message)
            .collect::<Vec<_>>(),
        "subscriptions": store.active_subscriptions(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    users.stop_listening();
    inbox.stop_listening();
    info!("docsync demo shutting down");
    Ok(())
}
