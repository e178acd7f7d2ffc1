//! The engine's explicit container.
//!
//! A `SyncContext` is built once at start-up and handed to every component
//! that needs the remote store, configuration, entity decoders, or the named
//! collection caches. Cloning it is cheap and shares everything.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::SyncConfig;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::store::{RawDocument, RemoteStore};
use crate::sync::CollectionSync;
use crate::utils::{read, write};

/// Constructor for one entity type: raw store payload in, typed value out.
pub type Decoder<T> = Arc<dyn Fn(&RawDocument) -> SyncResult<T> + Send + Sync>;

struct ContextInner {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    decoders: RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
    collections: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl SyncContext {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                store,
                config,
                decoders: RwLock::new(HashMap::new()),
                collections: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Register the constructor for `T`, replacing any earlier one.
    pub fn register<T, F>(&self, decode: F)
    where
        T: Document,
        F: Fn(&RawDocument) -> SyncResult<T> + Send + Sync + 'static,
    {
        let decoder: Decoder<T> = Arc::new(decode);
        write(&self.inner.decoders).insert(T::KIND, Box::new(decoder));
        debug!(kind = T::KIND, "Decoder registered");
    }

    /// Register a serde-backed constructor for `T`.
    pub fn register_serde<T>(&self)
    where
        T: Document + DeserializeOwned,
    {
        self.register::<T, _>(|raw: &RawDocument| {
            serde_json::from_value(raw.data.clone()).map_err(|source| SyncError::Decode {
                reference: raw.reference.clone(),
                source,
            })
        });
    }

    pub fn decoder<T: Document>(&self) -> SyncResult<Decoder<T>> {
        read(&self.inner.decoders)
            .get(T::KIND)
            .and_then(|entry| entry.downcast_ref::<Decoder<T>>())
            .cloned()
            .ok_or(SyncError::UnregisteredKind(T::KIND))
    }

    pub fn decode<T: Document>(&self, raw: &RawDocument) -> SyncResult<T> {
        let decoder = self.decoder::<T>()?;
        decoder(raw)
    }

    /// Make a collection cache reachable by name from anywhere holding the
    /// context.
    pub fn register_collection<T: Document>(&self, name: impl Into<String>, sync: CollectionSync<T>) {
        write(&self.inner.collections).insert(name.into(), Box::new(sync));
    }

    pub fn collection<T: Document>(&self, name: &str) -> Option<CollectionSync<T>> {
        read(&self.inner.collections)
            .get(name)
            .and_then(|entry| entry.downcast_ref::<CollectionSync<T>>())
            .cloned()
    }
}
