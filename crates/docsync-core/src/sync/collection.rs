//! A cache bound to a live collection or query subscription.

use std::ops::{ControlFlow, Deref};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::store::{ChangeBatch, ChangeKind, CollectionRef, DocRef, Query, WriteBatch};
use crate::utils::lock;

use super::cache::{CacheShared, EntityCache, Readiness};
use super::entity::Entity;
use super::retry::{Backoff, RetryPolicy, SubscriptionState, Subscriber, SubscriptionTask};

#[derive(Default)]
struct Binding {
    query: Option<Query>,
    generation: u64,
    state: SubscriptionState,
    task: Option<SubscriptionTask>,
}

impl Binding {
    fn is_bound(&self) -> bool {
        self.query.is_some() && self.state != SubscriptionState::Failed
    }
}

/// An [`EntityCache`] fed by a collection subscription.
///
/// The first batch to arrive, even an empty one, makes the cache ready.
/// After a transport failure the subscription reconnects with back-off and
/// later batches layer on top of what is already cached.
pub struct CollectionSync<T: Document> {
    cache: EntityCache<T>,
    collection: CollectionRef,
    binding: Arc<Mutex<Binding>>,
}

impl<T: Document> Clone for CollectionSync<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            collection: self.collection.clone(),
            binding: Arc::clone(&self.binding),
        }
    }
}

impl<T: Document> Deref for CollectionSync<T> {
    type Target = EntityCache<T>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl<T: Document> CollectionSync<T> {
    pub fn new(ctx: &SyncContext, collection: CollectionRef) -> Self {
        let cache = EntityCache::with_readiness(
            ctx,
            collection.path().to_string(),
            Some(collection.clone()),
            Readiness::Latch { fired: false },
        );
        Self {
            cache,
            collection,
            binding: Arc::new(Mutex::new(Binding::default())),
        }
    }

    /// Build and bind in one step, retrying per the context's config.
    pub fn listen(
        ctx: &SyncContext,
        collection: CollectionRef,
        query: Option<Query>,
    ) -> SyncResult<Self> {
        let sync = Self::new(ctx, collection);
        sync.start_listening(query, ctx.config().retry_policy())?;
        Ok(sync)
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn cache(&self) -> &EntityCache<T> {
        &self.cache
    }

    /// Subscribe to `query`, or to the whole collection when `None`.
    ///
    /// Fails with [`SyncError::AlreadyBound`] while a subscription is active
    /// or retrying; stop it first. A subscription that has failed for good
    /// may be rebound.
    pub fn start_listening(&self, query: Option<Query>, retry: RetryPolicy) -> SyncResult<()> {
        let query = query.unwrap_or_else(|| self.collection.query());
        let generation = {
            let mut binding = lock(&self.binding);
            if binding.is_bound() {
                return Err(SyncError::AlreadyBound(self.cache.label().to_string()));
            }
            binding.generation += 1;
            binding.query = Some(query.clone());
            binding.state = SubscriptionState::Connecting;
            binding.task.take();
            binding.generation
        };

        let ctx = self.cache.context();
        let backoff = Backoff::new(retry, ctx.config().retry_ceiling());
        let task = SubscriptionTask::spawn(
            CollectionWatch {
                cache: self.cache.downgrade(),
                binding: Arc::downgrade(&self.binding),
                query: query.clone(),
                generation,
            },
            backoff,
        );

        let mut binding = lock(&self.binding);
        if binding.generation == generation {
            binding.task = Some(task);
        }
        drop(binding);
        info!(kind = T::KIND, query = %query, "Listening to collection");
        Ok(())
    }

    /// Cancel the subscription and any pending reconnect. Cached content is
    /// kept. Idempotent.
    pub fn stop_listening(&self) {
        let task = {
            let mut binding = lock(&self.binding);
            binding.generation += 1;
            binding.query = None;
            binding.state = SubscriptionState::Idle;
            binding.task.take()
        };
        if task.is_some() {
            debug!(collection = %self.collection, "Stopped listening");
        }
    }

    /// Stop listening, drop and detach every cached entity, and re-arm the
    /// ready latch for the next binding.
    pub fn clear(&self) {
        self.stop_listening();
        for entity in self.cache.clear() {
            entity.detach();
        }
        self.cache.reset_latch();
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        lock(&self.binding).state
    }

    pub fn is_listening(&self) -> bool {
        self.subscription_state() == SubscriptionState::Listening
    }

    /// The query currently bound, if any.
    pub fn query(&self) -> Option<Query> {
        lock(&self.binding).query.clone()
    }

    pub fn document_ref(&self, id: impl Into<String>) -> DocRef {
        self.collection.doc(id)
    }

    pub fn new_document_ref(&self) -> DocRef {
        self.collection.new_doc()
    }

    /// Write `payload` as a new document, under `id` or a fresh one. The
    /// subscription delivers it back into the cache.
    pub async fn create(
        &self,
        payload: &T,
        id: Option<&str>,
        batch: Option<&mut WriteBatch>,
    ) -> SyncResult<DocRef>
    where
        T: Serialize,
    {
        let reference = match id {
            Some(id) => self.document_ref(id),
            None => self.new_document_ref(),
        };
        let data = serde_json::to_value(payload).map_err(|source| SyncError::Decode {
            reference: reference.clone(),
            source,
        })?;
        match batch {
            Some(batch) => {
                batch.set(reference.clone(), data);
            }
            None => self.cache.context().store().set(&reference, data).await?,
        }
        Ok(reference)
    }

    pub async fn delete(&self, id: &str, batch: Option<&mut WriteBatch>) -> SyncResult<()> {
        let reference = self.document_ref(id);
        match batch {
            Some(batch) => {
                batch.delete(reference);
                Ok(())
            }
            None => self.cache.context().store().delete(&reference).await,
        }
    }
}

struct CollectionWatch<T: Document> {
    cache: Weak<CacheShared<T>>,
    binding: Weak<Mutex<Binding>>,
    query: Query,
    generation: u64,
}

impl<T: Document> CollectionWatch<T> {
    fn is_current(&self) -> bool {
        self.binding
            .upgrade()
            .map(|binding| lock(&binding).generation == self.generation)
            .unwrap_or(false)
    }

    fn apply(&self, cache: &EntityCache<T>, batch: ChangeBatch) {
        let ctx = cache.context().clone();
        for change in batch.changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    let entity = match Entity::from_raw(&ctx, &change.document) {
                        Ok(entity) => entity,
                        Err(e) => {
                            warn!(
                                reference = %change.document.reference,
                                error = %e,
                                "Skipping undecodable document"
                            );
                            continue;
                        }
                    };
                    if let Err(e) = cache.put(entity) {
                        warn!(reference = %change.document.reference, error = %e, "Cache rejected entity");
                    }
                }
                // Leaving a filtered result set is not a deletion, so the
                // entity is dropped from the cache but left intact.
                ChangeKind::Removed => {
                    cache.remove(change.document.id());
                }
            }
        }
    }
}

#[async_trait]
impl<T: Document> Subscriber for CollectionWatch<T> {
    type Item = ChangeBatch;

    fn label(&self) -> String {
        format!("{}:{}", T::KIND, self.query)
    }

    async fn connect(&self) -> SyncResult<BoxStream<'static, SyncResult<ChangeBatch>>> {
        let store = match self.cache.upgrade() {
            Some(shared) => EntityCache::from_shared(shared).context().store().clone(),
            None => return Err(SyncError::transport("collection dropped")),
        };
        store.subscribe(&self.query).await
    }

    fn set_state(&self, state: SubscriptionState) -> bool {
        let Some(binding) = self.binding.upgrade() else {
            return false;
        };
        let mut binding = lock(&binding);
        if binding.generation != self.generation {
            return false;
        }
        binding.state = state;
        true
    }

    fn deliver(&mut self, batch: ChangeBatch) -> ControlFlow<()> {
        let Some(shared) = self.cache.upgrade() else {
            return ControlFlow::Break(());
        };
        if !self.is_current() {
            return ControlFlow::Break(());
        }
        let cache = EntityCache::from_shared(shared);
        let changes = batch.changes.len();
        self.apply(&cache, batch);
        debug!(query = %self.query, changes, size = cache.len(), "Batch applied");
        if cache.mark_ready() {
            info!(query = %self.query, size = cache.len(), "Collection ready");
        }
        ControlFlow::Continue(())
    }
}
