//! A single synchronized remote document.
//!
//! An [`Entity`] is a cheap, clonable handle; every clone shares the same
//! payload, flags, observers and subscription. The same entity may sit in
//! several caches at once: it keeps weak back-links to each so a live
//! snapshot can be pushed into all of them, and a server-side delete can be
//! propagated as a removal.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::store::{DocRef, DocumentSnapshot, RawDocument, WriteBatch};
use crate::utils::{lock, read, write};

use super::cache::{CacheShared, EntityCache};
use super::listener::ListenerHandle;
use super::retry::{Backoff, RetryPolicy, SubscriptionState, Subscriber, SubscriptionTask};

type Observer<T> = Arc<dyn Fn(&Entity<T>) + Send + Sync>;

/// One-shot callback for the first snapshot of a watch cycle.
pub type EntityReadyFn<T> = Box<dyn FnOnce(&Entity<T>) + Send>;

struct EntityState<T: Document> {
    payload: Option<T>,
    available: bool,
    removed: bool,
    listening: bool,
    subscription: SubscriptionState,
    last_synced_at: Option<DateTime<Utc>>,
    caches: Vec<Weak<CacheShared<T>>>,
    generation: u64,
    task: Option<SubscriptionTask>,
}

struct EntityInner<T: Document> {
    ctx: SyncContext,
    reference: RwLock<Option<DocRef>>,
    state: Mutex<EntityState<T>>,
    update_gate: Mutex<()>,
    observers: Mutex<Vec<(u64, Observer<T>)>>,
    next_observer: AtomicU64,
}

pub struct Entity<T: Document> {
    inner: Arc<EntityInner<T>>,
}

impl<T: Document> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Document> Entity<T> {
    fn build(ctx: &SyncContext, reference: Option<DocRef>, payload: Option<T>) -> Self {
        let available = payload.is_some() && reference.is_some();
        Self {
            inner: Arc::new(EntityInner {
                ctx: ctx.clone(),
                reference: RwLock::new(reference),
                state: Mutex::new(EntityState {
                    payload,
                    available,
                    removed: false,
                    listening: false,
                    subscription: SubscriptionState::Idle,
                    last_synced_at: None,
                    caches: Vec::new(),
                    generation: 0,
                    task: None,
                }),
                update_gate: Mutex::new(()),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    /// A local value with no identity yet. Bind it before watching or
    /// inserting it into a cache.
    pub fn new(ctx: &SyncContext, payload: T) -> Self {
        Self::build(ctx, None, Some(payload))
    }

    /// An entity waiting for its first snapshot.
    pub fn pending(ctx: &SyncContext, reference: DocRef) -> Self {
        Self::build(ctx, Some(reference), None)
    }

    /// An entity built from an already decoded server value.
    pub fn from_snapshot(ctx: &SyncContext, reference: DocRef, payload: T) -> Self {
        Self::build(ctx, Some(reference), Some(payload))
    }

    /// Decode `raw` through the context's registry.
    pub fn from_raw(ctx: &SyncContext, raw: &RawDocument) -> SyncResult<Self> {
        let payload = ctx.decode::<T>(raw)?;
        let entity = Self::from_snapshot(ctx, raw.reference.clone(), payload);
        lock(&entity.inner.state).last_synced_at = Some(raw.read_time);
        Ok(entity)
    }

    /// Attach identity. Does not start synchronization.
    pub fn bind_reference(&self, reference: DocRef) {
        *write(&self.inner.reference) = Some(reference);
        let mut state = lock(&self.inner.state);
        if state.payload.is_some() {
            state.available = true;
        }
    }

    pub fn reference(&self) -> Option<DocRef> {
        read(&self.inner.reference).clone()
    }

    pub fn id(&self) -> Option<String> {
        read(&self.inner.reference)
            .as_ref()
            .map(|reference| reference.id().to_string())
    }

    pub fn context(&self) -> &SyncContext {
        &self.inner.ctx
    }

    /// Detached copy of the current payload.
    pub fn snapshot(&self) -> Option<T> {
        lock(&self.inner.state).payload.clone()
    }

    pub fn with_payload<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        lock(&self.inner.state).payload.as_ref().map(f)
    }

    /// Edit the local payload. Observers are not notified; local edits are
    /// overwritten by the next server snapshot.
    ///
    /// The edit is serialized with server merges, so state installed here
    /// (such as an owned sub-cache) is seen by the next `apply_update`. `f`
    /// runs outside the state lock but must not re-enter this entity's
    /// `with_payload_mut`.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let _serial = lock(&self.inner.update_gate);
        let mut payload = lock(&self.inner.state).payload.clone()?;
        let result = f(&mut payload);
        lock(&self.inner.state).payload = Some(payload);
        Some(result)
    }

    pub fn is_available(&self) -> bool {
        lock(&self.inner.state).available
    }

    pub fn is_removed(&self) -> bool {
        lock(&self.inner.state).removed
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.state).listening
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        lock(&self.inner.state).subscription
    }

    /// Read time of the latest applied snapshot.
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).last_synced_at
    }

    /// Open (or restart) the live subscription for this document.
    ///
    /// Any earlier subscription and its pending reconnect are cancelled and
    /// the back-off starts again from the policy's initial interval.
    /// `on_ready` runs once, after the first snapshot of this cycle.
    pub fn start_watching(
        &self,
        retry: RetryPolicy,
        on_ready: Option<EntityReadyFn<T>>,
    ) -> SyncResult<()> {
        let reference = self
            .reference()
            .ok_or_else(|| SyncError::Unbound(format!("{} entity has no reference", T::KIND)))?;

        let (generation, previous) = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.removed = false;
            state.listening = false;
            state.subscription = SubscriptionState::Connecting;
            (state.generation, state.task.take())
        };
        drop(previous);

        let backoff = Backoff::new(retry, self.inner.ctx.config().retry_ceiling());
        let task = SubscriptionTask::spawn(
            EntityWatch {
                entity: Arc::downgrade(&self.inner),
                reference: reference.clone(),
                generation,
                on_ready: Mutex::new(on_ready),
            },
            backoff,
        );

        let mut state = lock(&self.inner.state);
        if state.generation == generation {
            state.task = Some(task);
        }
        drop(state);
        debug!(kind = T::KIND, reference = %reference, "Watching entity");
        Ok(())
    }

    /// Cancel the subscription and any pending reconnect. Idempotent.
    pub fn stop_watching(&self) {
        let task = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.listening = false;
            state.subscription = SubscriptionState::Idle;
            state.task.take()
        };
        if task.is_some() {
            debug!(kind = T::KIND, reference = ?self.reference(), "Stopped watching entity");
        }
    }

    /// Logically destroy the entity: cancel its subscription, drop every
    /// cache back-link and notify observers one last time.
    pub fn detach(&self) {
        let task = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.removed = true;
            state.available = false;
            state.listening = false;
            state.subscription = SubscriptionState::Idle;
            state.caches.clear();
            state.task.take()
        };
        drop(task);
        self.notify_observers();
    }

    /// Observe value changes. The observer is called at once with the
    /// current state, then after every applied snapshot and on removal.
    pub fn add_observer<F>(&self, observer: F) -> ListenerHandle
    where
        F: Fn(&Entity<T>) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        let observer: Observer<T> = Arc::new(observer);
        lock(&self.inner.observers).push((id, observer.clone()));
        observer(self);

        let weak = Arc::downgrade(&self.inner);
        ListenerHandle::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                Entity { inner }.remove_observer(id);
            }
        })
    }

    pub fn remove_observer(&self, id: u64) -> bool {
        let mut observers = lock(&self.inner.observers);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    /// Merge `fields` into the remote document, or queue the update into
    /// `batch` when one is given.
    pub async fn send_update(
        &self,
        fields: Map<String, Value>,
        batch: Option<&mut WriteBatch>,
    ) -> SyncResult<()> {
        let reference = self.bound_reference()?;
        match batch {
            Some(batch) => {
                batch.update(reference, fields);
                Ok(())
            }
            None => self.inner.ctx.store().update(&reference, fields).await,
        }
    }

    pub async fn send_delete(&self, batch: Option<&mut WriteBatch>) -> SyncResult<()> {
        let reference = self.bound_reference()?;
        match batch {
            Some(batch) => {
                batch.delete(reference);
                Ok(())
            }
            None => self.inner.ctx.store().delete(&reference).await,
        }
    }

    fn bound_reference(&self) -> SyncResult<DocRef> {
        self.reference()
            .ok_or_else(|| SyncError::Unbound(format!("{} entity has no reference", T::KIND)))
    }

    pub(crate) fn ptr_eq(&self, other: &Entity<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fold `other`'s server state into this entity through the payload's
    /// merge contract.
    pub(crate) fn merge_from(&self, other: &Entity<T>) {
        if self.ptr_eq(other) {
            return;
        }
        let (payload, available, synced) = {
            let state = lock(&other.inner.state);
            (state.payload.clone(), state.available, state.last_synced_at)
        };
        if let Some(payload) = payload {
            self.apply_payload(payload);
        }
        let mut state = lock(&self.inner.state);
        state.available |= available;
        state.removed = false;
        if synced.is_some() {
            state.last_synced_at = synced;
        }
    }

    /// `apply_update` runs on a copy outside the state lock: payloads that
    /// own sub-caches push reference lists from inside it.
    fn apply_payload(&self, incoming: T) {
        let _serial = lock(&self.inner.update_gate);
        let current = lock(&self.inner.state).payload.clone();
        let merged = match current {
            Some(mut payload) => {
                payload.apply_update(incoming);
                payload
            }
            None => incoming,
        };
        lock(&self.inner.state).payload = Some(merged);
    }

    pub(crate) fn link_cache(&self, cache: &Arc<CacheShared<T>>) {
        let mut state = lock(&self.inner.state);
        state.caches.retain(|weak| weak.strong_count() > 0);
        if !state
            .caches
            .iter()
            .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(cache)))
        {
            state.caches.push(Arc::downgrade(cache));
        }
    }

    pub(crate) fn unlink_cache(&self, cache: &CacheShared<T>) {
        lock(&self.inner.state)
            .caches
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), cache));
    }

    #[cfg(test)]
    pub(crate) fn linked_cache_count(&self) -> usize {
        lock(&self.inner.state)
            .caches
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn linked_caches(&self) -> Vec<EntityCache<T>> {
        lock(&self.inner.state)
            .caches
            .iter()
            .filter_map(Weak::upgrade)
            .map(EntityCache::from_shared)
            .collect()
    }

    fn notify_observers(&self) {
        let observers: Vec<Observer<T>> = lock(&self.inner.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(self);
        }
    }

    fn is_generation(&self, generation: u64) -> bool {
        lock(&self.inner.state).generation == generation
    }

    fn apply_snapshot(&self, snapshot: DocumentSnapshot) -> ControlFlow<()> {
        let reference = snapshot.reference.clone();
        match snapshot.into_raw() {
            Some(raw) => {
                let payload = match self.inner.ctx.decode::<T>(&raw) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(reference = %reference, error = %e, "Dropping undecodable snapshot");
                        return ControlFlow::Continue(());
                    }
                };
                self.apply_payload(payload);
                {
                    let mut state = lock(&self.inner.state);
                    state.available = true;
                    state.removed = false;
                    state.listening = true;
                    state.last_synced_at = Some(raw.read_time);
                }
                for cache in self.linked_caches() {
                    if let Err(e) = cache.put(self.clone()) {
                        warn!(reference = %reference, error = %e, "Cache rejected entity");
                    }
                }
                self.notify_observers();
                ControlFlow::Continue(())
            }
            None => {
                info!(kind = T::KIND, reference = %reference, "Document no longer exists");
                let (caches, task) = {
                    let mut state = lock(&self.inner.state);
                    state.generation += 1;
                    state.available = false;
                    state.removed = true;
                    state.listening = false;
                    state.subscription = SubscriptionState::Idle;
                    (std::mem::take(&mut state.caches), state.task.take())
                };
                for cache in caches.iter().filter_map(Weak::upgrade) {
                    let cache = EntityCache::from_shared(cache);
                    cache.cancel_pending(reference.id());
                    cache.remove(reference.id());
                }
                self.notify_observers();
                // Dropping our own task handle aborts at the next await point,
                // after this delivery has already returned.
                drop(task);
                ControlFlow::Break(())
            }
        }
    }
}

impl<T: Document> PartialEq for Entity<T> {
    /// Bound entities are equal when they point at the same document; an
    /// unbound entity is only equal to itself.
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self.reference(), other.reference()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Document> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("kind", &T::KIND)
            .field("reference", &self.reference())
            .finish_non_exhaustive()
    }
}

/// Drives one entity's document subscription. Holds the entity weakly so an
/// abandoned entity is not kept alive by its own feed.
struct EntityWatch<T: Document> {
    entity: Weak<EntityInner<T>>,
    reference: DocRef,
    generation: u64,
    on_ready: Mutex<Option<EntityReadyFn<T>>>,
}

impl<T: Document> EntityWatch<T> {
    fn entity(&self) -> Option<Entity<T>> {
        self.entity.upgrade().map(|inner| Entity { inner })
    }
}

#[async_trait]
impl<T: Document> Subscriber for EntityWatch<T> {
    type Item = DocumentSnapshot;

    fn label(&self) -> String {
        format!("{}:{}", T::KIND, self.reference)
    }

    async fn connect(&self) -> SyncResult<BoxStream<'static, SyncResult<DocumentSnapshot>>> {
        let store = match self.entity() {
            Some(entity) => entity.inner.ctx.store().clone(),
            None => return Err(SyncError::transport("entity dropped")),
        };
        store.subscribe_document(&self.reference).await
    }

    fn set_state(&self, state: SubscriptionState) -> bool {
        let Some(entity) = self.entity() else {
            return false;
        };
        let mut current = lock(&entity.inner.state);
        if current.generation != self.generation {
            return false;
        }
        current.subscription = state;
        if state != SubscriptionState::Listening {
            current.listening = false;
        }
        true
    }

    fn deliver(&mut self, snapshot: DocumentSnapshot) -> ControlFlow<()> {
        let Some(entity) = self.entity() else {
            return ControlFlow::Break(());
        };
        if !entity.is_generation(self.generation) {
            return ControlFlow::Break(());
        }
        let flow = entity.apply_snapshot(snapshot);
        let on_ready = lock(&self.on_ready).take();
        if let Some(on_ready) = on_ready {
            on_ready(&entity);
        }
        flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RemoteStore};
    use crate::test_support::{context_with_store, wait_until, Note};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn note_ref(id: &str) -> DocRef {
        DocRef::new("notes", id)
    }

    #[tokio::test]
    async fn test_start_watching_requires_reference() {
        let (ctx, _store) = context_with_store();
        let entity = Entity::new(&ctx, Note::default());
        let err = entity
            .start_watching(RetryPolicy::Disabled, None)
            .expect_err("unbound");
        assert!(matches!(err, SyncError::Unbound(_)));
        assert!(!entity.is_available());
    }

    #[tokio::test]
    async fn test_watching_applies_snapshots() {
        let (ctx, store) = context_with_store();
        store.seed(note_ref("a"), json!({"text": "first"}));

        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        assert!(!entity.is_available());

        let ready = Arc::new(AtomicUsize::new(0));
        let ready_count = ready.clone();
        entity
            .start_watching(
                RetryPolicy::Disabled,
                Some(Box::new(move |_| {
                    ready_count.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .expect("watch");

        wait_until(|| entity.is_available()).await;
        assert_eq!(entity.snapshot().map(|n| n.text), Some("first".to_string()));
        assert!(entity.is_listening());
        assert_eq!(entity.subscription_state(), SubscriptionState::Listening);
        assert!(entity.last_synced_at().is_some());

        store.seed(note_ref("a"), json!({"text": "second"}));
        wait_until(|| entity.with_payload(|n| n.text == "second").unwrap_or(false)).await;
        assert_eq!(ready.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_delete_marks_removed() {
        let (ctx, store) = context_with_store();
        store.seed(note_ref("gone"), json!({"text": "x"}));
        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("gone"));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_count = seen.clone();
        let _observer = entity.add_observer(move |_| {
            seen_count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1, "replays current state");

        entity.start_watching(RetryPolicy::Disabled, None).expect("watch");
        wait_until(|| entity.is_available()).await;

        let mut batch = WriteBatch::new();
        entity.send_delete(Some(&mut batch)).await.expect("queue");
        store.commit(batch).await.expect("commit");

        wait_until(|| entity.is_removed()).await;
        assert!(!entity.is_available());
        assert!(!entity.is_listening());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        wait_until(|| store.active_subscriptions() == 0).await;
    }

    #[tokio::test]
    async fn test_stop_watching_is_idempotent() {
        let (ctx, store) = context_with_store();
        store.seed(note_ref("a"), json!({"text": "x"}));
        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        entity.start_watching(RetryPolicy::Disabled, None).expect("watch");
        wait_until(|| entity.is_listening()).await;

        entity.stop_watching();
        entity.stop_watching();
        assert_eq!(entity.subscription_state(), SubscriptionState::Idle);
        wait_until(|| store.active_subscriptions() == 0).await;

        // Writes after stopping are not applied.
        store.seed(note_ref("a"), json!({"text": "later"}));
        tokio::task::yield_now().await;
        assert_eq!(entity.snapshot().map(|n| n.text), Some("x".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_watching_cancels_pending_reconnect() {
        let (ctx, store) = context_with_store();
        store.fail_next_subscribes(1);
        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        entity
            .start_watching(RetryPolicy::from_millis(1000), None)
            .expect("watch");

        wait_until(|| entity.subscription_state() == SubscriptionState::Retrying).await;
        assert_eq!(store.subscribe_count(), 1);
        entity.stop_watching();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.subscribe_count(), 1);
        assert_eq!(entity.subscription_state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transport_failure() {
        let (ctx, store) = context_with_store();
        store.seed(note_ref("a"), json!({"text": "x"}));
        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        entity
            .start_watching(RetryPolicy::from_millis(1000), None)
            .expect("watch");
        wait_until(|| entity.is_listening()).await;

        store.break_subscriptions("connection reset");
        wait_until(|| entity.subscription_state() == SubscriptionState::Retrying).await;
        assert!(!entity.is_listening());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        wait_until(|| entity.is_listening()).await;
        assert_eq!(store.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_retry_fails_once() {
        let (ctx, store) = context_with_store();
        store.fail_next_subscribes(1);
        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        entity.start_watching(RetryPolicy::Disabled, None).expect("watch");
        wait_until(|| entity.subscription_state() == SubscriptionState::Failed).await;
        assert_eq!(store.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_notifies_and_stops() {
        let (ctx, store) = context_with_store();
        store.seed(note_ref("a"), json!({"text": "x"}));
        let entity: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        entity.start_watching(RetryPolicy::Disabled, None).expect("watch");
        wait_until(|| entity.is_available()).await;

        let removed_seen = Arc::new(AtomicUsize::new(0));
        let removed_count = removed_seen.clone();
        let _observer = entity.add_observer(move |e| {
            if e.is_removed() {
                removed_count.fetch_add(1, Ordering::SeqCst);
            }
        });

        entity.detach();
        assert!(entity.is_removed());
        assert_eq!(removed_seen.load(Ordering::SeqCst), 1);
        wait_until(|| store.active_subscriptions() == 0).await;
    }

    #[tokio::test]
    async fn test_observer_handle_releases() {
        let (ctx, _store) = context_with_store();
        let entity = Entity::from_snapshot(&ctx, note_ref("a"), Note::default());
        let handle = entity.add_observer(|_| {});
        assert_eq!(entity.observer_count(), 1);
        drop(handle);
        assert_eq!(entity.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_send_update_writes_through() {
        let (ctx, store) = context_with_store();
        store.seed(note_ref("a"), json!({"text": "x", "tags": []}));
        let entity = Entity::from_snapshot(&ctx, note_ref("a"), Note::default());

        let mut fields = Map::new();
        fields.insert("text".to_string(), json!("y"));
        entity.send_update(fields, None).await.expect("update");
        assert_eq!(
            store.document(&note_ref("a")),
            Some(json!({"text": "y", "tags": []}))
        );
    }

    #[test]
    fn test_equality_by_reference() {
        let ctx = SyncContext::new(Arc::new(MemoryStore::new()), Default::default());
        let a = Entity::from_snapshot(&ctx, note_ref("a"), Note::default());
        let a_again: Entity<Note> = Entity::pending(&ctx, note_ref("a"));
        let b: Entity<Note> = Entity::pending(&ctx, note_ref("b"));
        assert_eq!(a, a_again);
        assert_ne!(a, b);

        let loose = Entity::new(&ctx, Note::default());
        let other_loose = Entity::new(&ctx, Note::default());
        assert_eq!(loose, loose.clone());
        assert_ne!(loose, other_loose);
    }

    #[test]
    fn test_merge_uses_apply_update() {
        let ctx = SyncContext::new(Arc::new(MemoryStore::new()), Default::default());
        let current = Entity::from_snapshot(
            &ctx,
            note_ref("a"),
            Note {
                text: "old".into(),
                tags: vec!["keep".into()],
                ..Note::default()
            },
        );
        let incoming = Entity::from_snapshot(
            &ctx,
            note_ref("a"),
            Note {
                text: "new".into(),
                tags: vec![],
                ..Note::default()
            },
        );
        current.merge_from(&incoming);
        let merged = current.snapshot().expect("payload");
        assert_eq!(merged.text, "new");
        // Note keeps local tags when the incoming list is empty.
        assert_eq!(merged.tags, vec!["keep".to_string()]);

        // Merging an entity into itself is a no-op.
        current.merge_from(&current.clone());
        assert_eq!(current.snapshot().map(|n| n.text), Some("new".to_string()));
    }
}
