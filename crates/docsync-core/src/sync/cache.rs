//! Ordered, id-indexed entity cache with listener fan-out.
//!
//! Entities are kept in insertion order alongside an `id -> position` map.
//! Every mutation goes through the cache's dispatch gate, which also covers
//! delivering the resulting events, so a listener never sees the sequence and
//! the map out of step and never sees an incremental event ahead of its own
//! snapshot replay.
//!
//! Lock order inside one cache is gate, then state, then registry; the state
//! and registry locks are never held while user code runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::context::SyncContext;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::store::{CollectionRef, DocRef};
use crate::utils::lock;

use super::entity::Entity;
use super::listener::ListenerHandle;

/// A change to a cache's ordered content.
#[derive(Clone)]
pub enum CacheEvent<T: Document> {
    Inserted { position: usize, entity: Entity<T> },
    Changed { position: usize, entity: Entity<T> },
    Removed { position: usize, entity: Entity<T> },
    /// The whole content was replaced. Sent as the replay to a new listener
    /// and by `clear`.
    Replaced { entities: Vec<Entity<T>> },
    SizeChanged { size: usize },
}

/// Receives a cache's events in order.
///
/// Events are delivered while the cache's dispatch gate is held, and the
/// gate is not reentrant: a listener must not call `put`, `remove`, `clear`
/// or `add_listener` on the cache that is notifying it. Reads are fine.
pub trait CacheListener<T: Document>: Send + Sync + 'static {
    fn on_event(&self, event: &CacheEvent<T>);
}

impl<T, F> CacheListener<T> for F
where
    T: Document,
    F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &CacheEvent<T>) {
        self(event)
    }
}

/// What a per-id observer is told.
#[derive(Clone)]
pub enum IdEvent<T: Document> {
    /// The id was inserted or changed; also the immediate replay when it is
    /// already cached.
    Present(Entity<T>),
    Removed(String),
}

/// When a persistent completion listener fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    /// Every time readiness is evaluated and holds.
    #[default]
    EveryUpdate,
    /// Only when readiness goes from not holding to holding.
    OnTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Immediate,
    Latch { fired: bool },
    Cardinality { required: usize },
}

type ReadyFn<T> = Box<dyn FnOnce(&EntityCache<T>) + Send>;
type CompletionFn<T> = Arc<dyn Fn(&EntityCache<T>) + Send + Sync>;
type IdObserver<T> = Arc<dyn Fn(&IdEvent<T>) + Send + Sync>;

struct CacheState<T: Document> {
    slots: Vec<(String, Entity<T>)>,
    index: HashMap<String, usize>,
    readiness: Readiness,
    suspended: bool,
    was_ready: bool,
    ready_queue: Vec<ReadyFn<T>>,
    revision: u64,
    /// Watching entities started for ids that have not been delivered yet.
    pending: HashMap<String, Entity<T>>,
}

impl<T: Document> CacheState<T> {
    fn ready_now(&self) -> bool {
        if self.suspended {
            return false;
        }
        match self.readiness {
            Readiness::Immediate => true,
            Readiness::Latch { fired } => fired,
            Readiness::Cardinality { required } => self.slots.len() == required,
        }
    }
}

struct Registry<T: Document> {
    listeners: Vec<(u64, Arc<dyn CacheListener<T>>)>,
    id_watchers: HashMap<String, Vec<(u64, IdObserver<T>)>>,
    completions: Vec<(u64, CompletionPolicy, CompletionFn<T>)>,
}

pub(crate) struct CacheShared<T: Document> {
    ctx: SyncContext,
    label: String,
    collection: Option<CollectionRef>,
    gate: Mutex<()>,
    state: Mutex<CacheState<T>>,
    registry: Mutex<Registry<T>>,
    next_id: AtomicU64,
}

pub struct EntityCache<T: Document> {
    shared: Arc<CacheShared<T>>,
}

impl<T: Document> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Document> EntityCache<T> {
    /// A free-standing cache. Its readiness always holds.
    pub fn new(ctx: &SyncContext, label: impl Into<String>) -> Self {
        Self::with_readiness(ctx, label, None, Readiness::Immediate)
    }

    /// A free-standing cache whose ids live in `collection`, which lets
    /// `request_get` and `query_get` reach the store.
    pub fn over_collection(ctx: &SyncContext, collection: CollectionRef) -> Self {
        let label = collection.path().to_string();
        Self::with_readiness(ctx, label, Some(collection), Readiness::Immediate)
    }

    pub(crate) fn with_readiness(
        ctx: &SyncContext,
        label: impl Into<String>,
        collection: Option<CollectionRef>,
        readiness: Readiness,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                ctx: ctx.clone(),
                label: label.into(),
                collection,
                gate: Mutex::new(()),
                state: Mutex::new(CacheState {
                    slots: Vec::new(),
                    index: HashMap::new(),
                    readiness,
                    suspended: false,
                    was_ready: false,
                    ready_queue: Vec::new(),
                    revision: 0,
                    pending: HashMap::new(),
                }),
                registry: Mutex::new(Registry {
                    listeners: Vec::new(),
                    id_watchers: HashMap::new(),
                    completions: Vec::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<CacheShared<T>>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheShared<T>> {
        Arc::downgrade(&self.shared)
    }

    pub fn context(&self) -> &SyncContext {
        &self.shared.ctx
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// The collection one-shot requests go to, if this cache has one.
    pub fn collection_ref(&self) -> Option<&CollectionRef> {
        self.shared.collection.as_ref()
    }

    /// Insert `entity`, or merge it into the cached entity with the same id.
    ///
    /// A new id emits `Inserted` at the tail followed by `SizeChanged`; a
    /// known id emits a single `Changed` at its current position.
    pub fn put(&self, entity: Entity<T>) -> SyncResult<()> {
        self.insert(entity, true)
    }

    /// `put` without a back-link: the entity's own feed keeps updating some
    /// other cache, and this one hears about it through that cache.
    pub(crate) fn put_observed(&self, entity: Entity<T>) -> SyncResult<()> {
        self.insert(entity, false)
    }

    fn insert(&self, entity: Entity<T>, link: bool) -> SyncResult<()> {
        let id = entity.id().ok_or_else(|| {
            SyncError::Unbound(format!("cannot cache unbound {} entity", T::KIND))
        })?;

        let gate = lock(&self.shared.gate);
        let existing = {
            let state = lock(&self.shared.state);
            state
                .index
                .get(&id)
                .map(|&position| (position, state.slots[position].1.clone()))
        };

        let events = match existing {
            Some((position, current)) => {
                current.merge_from(&entity);
                lock(&self.shared.state).revision += 1;
                vec![CacheEvent::Changed {
                    position,
                    entity: current,
                }]
            }
            None => {
                if link {
                    entity.link_cache(&self.shared);
                }
                let (position, superseded) = {
                    let mut state = lock(&self.shared.state);
                    let superseded = state
                        .pending
                        .remove(&id)
                        .filter(|pending| !pending.ptr_eq(&entity));
                    let position = state.slots.len();
                    state.slots.push((id.clone(), entity.clone()));
                    state.index.insert(id.clone(), position);
                    state.revision += 1;
                    (position, superseded)
                };
                if let Some(pending) = superseded {
                    self.retire_pending(&pending);
                }
                vec![
                    CacheEvent::Inserted { position, entity },
                    CacheEvent::SizeChanged { size: position + 1 },
                ]
            }
        };

        self.dispatch(&events);
        drop(gate);
        self.after_mutation();
        Ok(())
    }

    /// Drop `id` from the cache. Absent ids are ignored silently.
    ///
    /// The entity keeps its subscription; detaching it is up to the caller.
    pub fn remove(&self, id: &str) -> Option<Entity<T>> {
        let gate = lock(&self.shared.gate);
        let (position, entity, size) = {
            let mut state = lock(&self.shared.state);
            let position = state.index.remove(id)?;
            let (_, entity) = state.slots.remove(position);
            let CacheState { slots, index, .. } = &mut *state;
            for (offset, (slot_id, _)) in slots.iter().enumerate().skip(position) {
                index.insert(slot_id.clone(), offset);
            }
            state.revision += 1;
            (position, entity, state.slots.len())
        };
        entity.unlink_cache(&self.shared);

        self.dispatch(&[
            CacheEvent::Removed {
                position,
                entity: entity.clone(),
            },
            CacheEvent::SizeChanged { size },
        ]);
        drop(gate);
        self.after_mutation();
        Some(entity)
    }

    /// Empty the cache, emitting a single empty `Replaced`.
    pub fn clear(&self) -> Vec<Entity<T>> {
        let gate = lock(&self.shared.gate);
        let removed = {
            let mut state = lock(&self.shared.state);
            state.index.clear();
            state.revision += 1;
            std::mem::take(&mut state.slots)
        };
        for (_, entity) in &removed {
            entity.unlink_cache(&self.shared);
        }

        let listeners = self.listener_snapshot();
        let event = CacheEvent::Replaced {
            entities: Vec::new(),
        };
        for listener in &listeners {
            listener.on_event(&event);
        }
        for (id, _) in &removed {
            self.notify_id(id, &IdEvent::Removed(id.clone()));
        }
        drop(gate);
        debug!(cache = %self.shared.label, cleared = removed.len(), "Cache cleared");
        self.after_mutation();
        removed.into_iter().map(|(_, entity)| entity).collect()
    }

    pub fn get(&self, id: &str) -> Option<Entity<T>> {
        let state = lock(&self.shared.state);
        state
            .index
            .get(id)
            .map(|&position| state.slots[position].1.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.shared.state).index.contains_key(id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        lock(&self.shared.state).index.get(id).copied()
    }

    /// The cached entities in order.
    pub fn entities(&self) -> Vec<Entity<T>> {
        lock(&self.shared.state)
            .slots
            .iter()
            .map(|(_, entity)| entity.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.shared.state)
            .slots
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Detached copies of every available payload, in order.
    pub fn snapshot(&self) -> Vec<T> {
        self.entities()
            .iter()
            .filter_map(Entity::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener. Before this returns the listener receives a
    /// `Replaced` with the current content and a `SizeChanged`, ahead of any
    /// later incremental event.
    ///
    /// Must not be called from inside a listener of this same cache.
    pub fn add_listener(&self, listener: impl CacheListener<T>) -> ListenerHandle {
        let listener: Arc<dyn CacheListener<T>> = Arc::new(listener);
        let id = self.next_id();

        let gate = lock(&self.shared.gate);
        let entities = self.entities();
        let size = entities.len();
        lock(&self.shared.registry)
            .listeners
            .push((id, listener.clone()));
        listener.on_event(&CacheEvent::Replaced { entities });
        listener.on_event(&CacheEvent::SizeChanged { size });
        drop(gate);

        let weak = self.downgrade();
        ListenerHandle::new(id, move || {
            if let Some(shared) = weak.upgrade() {
                EntityCache::from_shared(shared).remove_listener(id);
            }
        })
    }

    /// Stop delivering to listener `id`. Unknown ids are ignored.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut registry = lock(&self.shared.registry);
        let before = registry.listeners.len();
        registry.listeners.retain(|(listener_id, _)| *listener_id != id);
        registry.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.registry).listeners.len()
    }

    /// Observe one id: called at once if it is cached, then on every insert,
    /// change or removal of that id.
    pub fn watch_id<F>(&self, id: &str, observer: F) -> ListenerHandle
    where
        F: Fn(&IdEvent<T>) + Send + Sync + 'static,
    {
        let observer: IdObserver<T> = Arc::new(observer);
        let handle_id = self.register_id_watcher(id, observer.clone());
        if let Some(entity) = self.get(id) {
            observer(&IdEvent::Present(entity));
        }
        let weak = self.downgrade();
        let id = id.to_string();
        ListenerHandle::new(handle_id, move || {
            if let Some(shared) = weak.upgrade() {
                EntityCache::from_shared(shared).unregister_id_watcher(&id, handle_id);
            }
        })
    }

    /// Resolve `reference` through this cache on behalf of another one.
    ///
    /// The observer receives the entity now if it is cached. Otherwise the
    /// cache starts (or shares) a watching entity linked to itself and the
    /// observer hears about it when it lands. Releasing the last requester of
    /// a still-unresolved id cancels that watch.
    pub fn request_listen<F>(&self, reference: &DocRef, observer: F) -> ListenerHandle
    where
        F: Fn(&IdEvent<T>) + Send + Sync + 'static,
    {
        let id = reference.id().to_string();
        let observer: IdObserver<T> = Arc::new(observer);
        let handle_id = self.register_id_watcher(&id, observer.clone());
        match self.get(&id) {
            Some(entity) => observer(&IdEvent::Present(entity)),
            None => {
                self.ensure_watcher(reference);
            }
        }

        let weak = self.downgrade();
        ListenerHandle::new(handle_id, move || {
            if let Some(shared) = weak.upgrade() {
                let cache = EntityCache::from_shared(shared);
                if cache.unregister_id_watcher(&id, handle_id) == 0 && cache.is_pending(&id) {
                    cache.cancel_pending(&id);
                }
            }
        })
    }

    /// Run `callback` once readiness holds: now if it already does,
    /// otherwise on the next occasion it does.
    pub fn on_ready(&self, callback: impl FnOnce(&EntityCache<T>) + Send + 'static) {
        let mut state = lock(&self.shared.state);
        if state.ready_now() {
            drop(state);
            callback(self);
        } else {
            state.ready_queue.push(Box::new(callback));
        }
    }

    /// Register a persistent listener for readiness occasions.
    pub fn on_complete<F>(&self, policy: CompletionPolicy, callback: F) -> ListenerHandle
    where
        F: Fn(&EntityCache<T>) + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.shared.registry)
            .completions
            .push((id, policy, Arc::new(callback)));
        let weak = self.downgrade();
        ListenerHandle::new(id, move || {
            if let Some(shared) = weak.upgrade() {
                lock(&shared.registry)
                    .completions
                    .retain(|(completion_id, _, _)| *completion_id != id);
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.shared.state).ready_now()
    }

    pub(crate) fn revision(&self) -> u64 {
        lock(&self.shared.state).revision
    }

    /// Flip a latch cache to ready. Returns `false` if it had already fired.
    pub(crate) fn mark_ready(&self) -> bool {
        {
            let mut state = lock(&self.shared.state);
            match state.readiness {
                Readiness::Latch { fired: false } => {
                    state.readiness = Readiness::Latch { fired: true };
                }
                _ => return false,
            }
        }
        self.check_ready();
        true
    }

    pub(crate) fn reset_latch(&self) {
        let mut state = lock(&self.shared.state);
        if let Readiness::Latch { .. } = state.readiness {
            state.readiness = Readiness::Latch { fired: false };
            state.was_ready = false;
        }
    }

    pub(crate) fn set_required(&self, required: usize) {
        lock(&self.shared.state).readiness = Readiness::Cardinality { required };
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        lock(&self.shared.state).suspended = suspended;
    }

    /// Evaluate readiness and, when it holds, drain the one-shot queue and
    /// notify completion listeners according to their policy.
    pub(crate) fn check_ready(&self) {
        let (queue, transition) = {
            let mut state = lock(&self.shared.state);
            if state.suspended {
                return;
            }
            let ready = state.ready_now();
            let transition = ready && !state.was_ready;
            state.was_ready = ready;
            if !ready {
                return;
            }
            (std::mem::take(&mut state.ready_queue), transition)
        };

        let completions: Vec<CompletionFn<T>> = lock(&self.shared.registry)
            .completions
            .iter()
            .filter(|(_, policy, _)| transition || *policy == CompletionPolicy::EveryUpdate)
            .map(|(_, _, callback)| callback.clone())
            .collect();

        debug!(
            cache = %self.shared.label,
            queued = queue.len(),
            completions = completions.len(),
            "Cache ready"
        );
        for callback in queue {
            callback(self);
        }
        for callback in completions {
            callback(self);
        }
    }

    fn after_mutation(&self) {
        let tracks_membership = matches!(
            lock(&self.shared.state).readiness,
            Readiness::Cardinality { .. }
        );
        if tracks_membership {
            self.check_ready();
        }
    }

    /// A watching entity for `reference`, shared with every other caller
    /// asking for the same unresolved id.
    pub(crate) fn ensure_watcher(&self, reference: &DocRef) -> Entity<T> {
        let id = reference.id().to_string();
        let entity = {
            let mut state = lock(&self.shared.state);
            if let Some(&position) = state.index.get(&id) {
                return state.slots[position].1.clone();
            }
            if let Some(pending) = state.pending.get(&id) {
                return pending.clone();
            }
            let entity = Entity::pending(&self.shared.ctx, reference.clone());
            state.pending.insert(id, entity.clone());
            entity
        };

        entity.link_cache(&self.shared);
        let retry = self.shared.ctx.config().retry_policy();
        if let Err(e) = entity.start_watching(retry, None) {
            warn!(cache = %self.shared.label, reference = %reference, error = %e, "Could not watch entity");
        }
        debug!(cache = %self.shared.label, reference = %reference, "Resolving entity");
        entity
    }

    pub(crate) fn is_pending(&self, id: &str) -> bool {
        lock(&self.shared.state).pending.contains_key(id)
    }

    pub(crate) fn pending_ids(&self) -> Vec<String> {
        lock(&self.shared.state).pending.keys().cloned().collect()
    }

    pub(crate) fn pending_references(&self) -> Vec<DocRef> {
        lock(&self.shared.state)
            .pending
            .values()
            .filter_map(Entity::reference)
            .collect()
    }

    /// Stop resolving `id` if it is still unresolved.
    pub(crate) fn cancel_pending(&self, id: &str) {
        let pending = lock(&self.shared.state).pending.remove(id);
        if let Some(pending) = pending {
            self.retire_pending(&pending);
            debug!(cache = %self.shared.label, id, "Cancelled pending resolution");
        }
    }

    fn retire_pending(&self, pending: &Entity<T>) {
        pending.stop_watching();
        pending.unlink_cache(&self.shared);
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register_id_watcher(&self, id: &str, observer: IdObserver<T>) -> u64 {
        let handle_id = self.next_id();
        lock(&self.shared.registry)
            .id_watchers
            .entry(id.to_string())
            .or_default()
            .push((handle_id, observer));
        handle_id
    }

    /// Returns how many watchers remain for `id`.
    fn unregister_id_watcher(&self, id: &str, handle_id: u64) -> usize {
        let mut registry = lock(&self.shared.registry);
        let Some(watchers) = registry.id_watchers.get_mut(id) else {
            return 0;
        };
        watchers.retain(|(watcher_id, _)| *watcher_id != handle_id);
        let remaining = watchers.len();
        if remaining == 0 {
            registry.id_watchers.remove(id);
        }
        remaining
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn CacheListener<T>>> {
        lock(&self.shared.registry)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn notify_id(&self, id: &str, event: &IdEvent<T>) {
        let watchers: Vec<IdObserver<T>> = lock(&self.shared.registry)
            .id_watchers
            .get(id)
            .map(|watchers| watchers.iter().map(|(_, w)| w.clone()).collect())
            .unwrap_or_default();
        for watcher in watchers {
            watcher(event);
        }
    }

    /// Deliver `events` to every listener, then to the affected id watchers.
    /// Runs under the gate.
    fn dispatch(&self, events: &[CacheEvent<T>]) {
        let listeners = self.listener_snapshot();
        for event in events {
            for listener in &listeners {
                listener.on_event(event);
            }
        }
        for event in events {
            match event {
                CacheEvent::Inserted { entity, .. } | CacheEvent::Changed { entity, .. } => {
                    if let Some(id) = entity.id() {
                        self.notify_id(&id, &IdEvent::Present(entity.clone()));
                    }
                }
                CacheEvent::Removed { entity, .. } => {
                    if let Some(id) = entity.id() {
                        self.notify_id(&id, &IdEvent::Removed(id.clone()));
                    }
                }
                CacheEvent::Replaced { .. } | CacheEvent::SizeChanged { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context_with_store, note, wait_until, EventLog, Note};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_put_new_emits_insert_and_size() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        let log = EventLog::default();
        let _handle = cache.add_listener(log.listener());
        log.clear();

        cache.put(note(&ctx, "a", "first")).expect("put");
        cache.put(note(&ctx, "b", "second")).expect("put");
        assert_eq!(
            log.take(),
            vec!["inserted:0:a", "size:1", "inserted:1:b", "size:2"]
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.index_of("b"), Some(1));
    }

    #[tokio::test]
    async fn test_put_existing_emits_single_change() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        let original = note(&ctx, "a", "first");
        cache.put(original.clone()).expect("put");

        let log = EventLog::default();
        let _handle = cache.add_listener(log.listener());
        log.clear();

        cache.put(note(&ctx, "a", "edited")).expect("put");
        assert_eq!(log.take(), vec!["changed:0:a"]);
        assert_eq!(cache.len(), 1);

        // The cached handle is kept and updated in place.
        let cached = cache.get("a").expect("cached");
        assert!(cached.ptr_eq(&original));
        assert_eq!(cached.snapshot().map(|n| n.text), Some("edited".to_string()));
    }

    #[tokio::test]
    async fn test_put_unbound_is_rejected() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::<Note>::new(&ctx, "notes");
        let err = cache
            .put(Entity::new(&ctx, Note::default()))
            .expect_err("unbound");
        assert!(matches!(err, SyncError::Unbound(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_remove_repacks_index() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        for id in ["a", "b", "c", "d"] {
            cache.put(note(&ctx, id, id)).expect("put");
        }
        let log = EventLog::default();
        let _handle = cache.add_listener(log.listener());
        log.clear();

        let removed = cache.remove("b").expect("present");
        assert_eq!(removed.id().as_deref(), Some("b"));
        assert_eq!(removed.linked_cache_count(), 0);
        assert_eq!(log.take(), vec!["removed:1:b", "size:3"]);
        assert_eq!(cache.index_of("c"), Some(1));
        assert_eq!(cache.index_of("d"), Some(2));
        assert_eq!(cache.ids(), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_remove_absent_is_silent() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::<Note>::new(&ctx, "notes");
        let log = EventLog::default();
        let _handle = cache.add_listener(log.listener());
        log.clear();

        assert!(cache.remove("missing").is_none());
        assert!(log.take().is_empty());
        assert!(cache.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_index_consistent_under_random_operations() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let id = format!("n{}", rng.gen_range(0..20));
            if rng.gen_bool(0.6) {
                cache.put(note(&ctx, &id, "x")).expect("put");
            } else {
                cache.remove(&id);
            }

            let ids = cache.ids();
            for (position, id) in ids.iter().enumerate() {
                assert_eq!(cache.index_of(id), Some(position));
                let entity = cache.get(id).expect("indexed id resolves");
                assert_eq!(entity.id().as_deref(), Some(id.as_str()));
            }
            assert_eq!(ids.len(), cache.len());
        }
    }

    #[tokio::test]
    async fn test_listener_replay_precedes_incremental() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        cache.put(note(&ctx, "a", "x")).expect("put");
        cache.put(note(&ctx, "b", "y")).expect("put");

        let log = EventLog::default();
        let _handle = cache.add_listener(log.listener());
        cache.put(note(&ctx, "c", "z")).expect("put");

        assert_eq!(
            log.take(),
            vec!["replaced:a,b", "size:2", "inserted:2:c", "size:3"]
        );
    }

    #[tokio::test]
    async fn test_listener_release_is_idempotent() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        let log = EventLog::default();
        let handle = cache.add_listener(log.listener());
        let id = handle.id();
        assert_eq!(cache.listener_count(), 1);

        drop(handle);
        assert_eq!(cache.listener_count(), 0);
        assert!(!cache.remove_listener(id));
        assert!(!cache.remove_listener(9999));

        log.clear();
        cache.put(note(&ctx, "a", "x")).expect("put");
        assert!(log.take().is_empty());
    }

    #[tokio::test]
    async fn test_clear_emits_single_replaced() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        cache.put(note(&ctx, "a", "x")).expect("put");
        cache.put(note(&ctx, "b", "y")).expect("put");
        let log = EventLog::default();
        let _handle = cache.add_listener(log.listener());
        log.clear();

        let removed = cache.clear();
        assert_eq!(removed.len(), 2);
        assert_eq!(log.take(), vec!["replaced:"]);
        assert!(cache.is_empty());
        assert!(!cache.contains("a"));
    }

    #[tokio::test]
    async fn test_on_ready_immediate_for_plain_cache() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::<Note>::new(&ctx, "notes");
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        cache.on_ready(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_latch_drains_queue_once() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::<Note>::with_readiness(
            &ctx,
            "notes",
            None,
            Readiness::Latch { fired: false },
        );
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = fired.clone();
            cache.on_ready(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(cache.mark_ready());
        assert!(!cache.mark_ready());
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_watch_id_follows_one_entity() {
        let (ctx, _store) = context_with_store();
        let cache = EntityCache::new(&ctx, "notes");
        cache.put(note(&ctx, "a", "x")).expect("put");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watch = cache.watch_id("a", move |event| {
            let label = match event {
                IdEvent::Present(entity) => {
                    format!("present:{}", entity.snapshot().map(|n| n.text).unwrap_or_default())
                }
                IdEvent::Removed(id) => format!("removed:{id}"),
            };
            lock(&sink).push(label);
        });

        cache.put(note(&ctx, "b", "other")).expect("put");
        cache.put(note(&ctx, "a", "y")).expect("put");
        cache.remove("a");
        assert_eq!(
            *lock(&seen),
            vec!["present:x", "present:y", "removed:a"]
        );
    }

    #[tokio::test]
    async fn test_request_listen_shares_one_watch() {
        let (ctx, store) = context_with_store();
        let reference = DocRef::new("notes", "a");
        store.seed(reference.clone(), json!({"text": "remote"}));
        let cache = EntityCache::<Note>::new(&ctx, "notes");

        let hits = Arc::new(AtomicUsize::new(0));
        let first_hits = hits.clone();
        let _first = cache.request_listen(&reference, move |event| {
            if let IdEvent::Present(_) = event {
                first_hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        let second_hits = hits.clone();
        let _second = cache.request_listen(&reference, move |event| {
            if let IdEvent::Present(_) = event {
                second_hits.fetch_add(1, Ordering::SeqCst);
            }
        });

        wait_until(|| cache.contains("a")).await;
        wait_until(|| hits.load(Ordering::SeqCst) == 2).await;
        assert_eq!(store.subscribe_count(), 1);
        assert!(!cache.is_pending("a"));

        // A third requester is served from the cache immediately.
        let third_hits = hits.clone();
        let _third = cache.request_listen(&reference, move |_| {
            third_hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_releasing_last_requester_cancels_resolution() {
        let (ctx, store) = context_with_store();
        let reference = DocRef::new("notes", "late");
        store.fail_next_subscribes(1);
        let cache = EntityCache::<Note>::new(&ctx, "notes");

        let handle = cache.request_listen(&reference, |_| {});
        assert!(cache.is_pending("late"));
        drop(handle);
        assert!(!cache.is_pending("late"));
        assert!(cache.pending_ids().is_empty());
    }
}
