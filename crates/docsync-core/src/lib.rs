//! docsync-core: a local, observable mirror of a real-time document store.
//!
//! The engine keeps typed entities and ordered entity caches in step with a
//! [`RemoteStore`](store::RemoteStore):
//!
//! - [`Entity`] follows one document through its own subscription.
//! - [`EntityCache`] is the ordered, id-indexed set every other cache builds
//!   on, with snapshot-replaying listeners and readiness callbacks.
//! - [`CollectionSync`] binds a cache to a collection or query subscription.
//! - [`ReferenceSetSync`] derives membership from a list of references held
//!   by some other entity.
//!
//! Everything is reached through a [`SyncContext`] built once at start-up.

pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod store;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::SyncConfig;
pub use context::{Decoder, SyncContext};
pub use document::Document;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use sync::{
    CacheEvent, CacheListener, CollectionSync, CompletionPolicy, DuplicatePolicy, Entity,
    EntityCache, IdEvent, ListenerHandle, ReferenceSetSync, RetryPolicy, SubscriptionState,
};
