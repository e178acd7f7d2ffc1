//! The synchronization engine: entities, caches and the subscriptions that
//! keep them current.

pub mod cache;
pub mod collection;
pub mod entity;
pub mod listener;
pub mod refs;
mod requests;
pub mod retry;

pub use cache::{CacheEvent, CacheListener, CompletionPolicy, EntityCache, IdEvent};
pub use collection::CollectionSync;
pub use entity::{Entity, EntityReadyFn};
pub use listener::ListenerHandle;
pub use refs::{DuplicatePolicy, ReferenceSetSync};
pub use retry::{Backoff, RetryPolicy, SubscriptionState};
