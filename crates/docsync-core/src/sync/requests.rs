//! One-shot request and wait primitives over an [`EntityCache`].

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::store::{CollectionRef, Query};
use crate::utils::lock;

use super::cache::{CacheEvent, EntityCache};
use super::entity::Entity;

impl<T: Document> EntityCache<T> {
    /// Return the cached entity for `id`, or fetch it once from the store.
    ///
    /// A fetched entity is decoded but not inserted. Served from the cache,
    /// the returned future is ready on first poll and no fetch is issued.
    pub async fn request_get(&self, id: &str) -> SyncResult<Entity<T>> {
        if let Some(entity) = self.get(id) {
            return Ok(entity);
        }
        let reference = self.home_collection()?.doc(id);
        debug!(cache = %self.label(), reference = %reference, "Fetching uncached entity");
        let raw = self
            .context()
            .store()
            .fetch_once(&reference)
            .await?
            .ok_or_else(|| SyncError::NotFound(reference.clone()))?;
        Entity::from_raw(self.context(), &raw)
    }

    /// Wait for `id` to appear in the cache, up to the configured window.
    pub async fn wait_get(&self, id: &str) -> SyncResult<Entity<T>> {
        let window = self.context().config().wait_timeout();
        self.wait_get_for(id, window).await
    }

    /// [`wait_get`](Self::wait_get) with an explicit window.
    ///
    /// The transient listener is released before this returns, whether the
    /// id showed up or the window ran out.
    pub async fn wait_get_for(&self, id: &str, window: Duration) -> SyncResult<Entity<T>> {
        if let Some(entity) = self.get(id) {
            return Ok(entity);
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let wanted = id.to_string();
        let handle = self.add_listener(move |event: &CacheEvent<T>| {
            let found = match event {
                CacheEvent::Inserted { entity, .. }
                    if entity.id().as_deref() == Some(wanted.as_str()) =>
                {
                    Some(entity.clone())
                }
                CacheEvent::Replaced { entities } => entities
                    .iter()
                    .find(|entity| entity.id().as_deref() == Some(wanted.as_str()))
                    .cloned(),
                _ => None,
            };
            if let Some(entity) = found {
                if let Some(tx) = lock(&tx).take() {
                    let _ = tx.send(entity);
                }
            }
        });

        let outcome = tokio::time::timeout(window, rx).await;
        handle.release();
        match outcome {
            Ok(Ok(entity)) => Ok(entity),
            Ok(Err(_)) => Err(SyncError::transport("wait listener dropped")),
            Err(_) => {
                warn!(
                    cache = %self.label(),
                    id,
                    after_ms = window.as_millis() as u64,
                    "wait_get timed out"
                );
                Err(SyncError::Timeout {
                    id: id.to_string(),
                    after: window,
                })
            }
        }
    }

    /// Run a one-shot query built from this cache's collection. The cache is
    /// neither read nor written.
    pub async fn query_get<F>(&self, build: F) -> SyncResult<Vec<Entity<T>>>
    where
        F: FnOnce(Query) -> Query + Send,
    {
        let query = build(self.home_collection()?.query());
        let documents = self.context().store().query(&query).await?;
        debug!(
            cache = %self.label(),
            query = %query,
            results = documents.len(),
            "Query fetched"
        );
        documents
            .iter()
            .map(|raw| Entity::from_raw(self.context(), raw))
            .collect()
    }

    fn home_collection(&self) -> SyncResult<&CollectionRef> {
        self.collection_ref().ok_or_else(|| {
            SyncError::Unbound(format!("cache {} has no collection", self.label()))
        })
    }
}
