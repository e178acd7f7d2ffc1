//! Remote document store seam.
//!
//! The engine talks to the backing store only through [`RemoteStore`]:
//! live query and document subscriptions, one-shot fetch and query, and
//! (optionally batched) writes. [`MemoryStore`] is an in-process
//! implementation used by tests and the demo binary.

pub mod memory;
pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::SyncResult;

pub use memory::MemoryStore;
pub use types::{
    ChangeBatch, ChangeKind, CollectionRef, DocRef, DocumentChange, DocumentSnapshot, Filter,
    FilterOp, Query, RawDocument, WriteBatch, WriteOp,
};

/// Live feed of query changes. Dropping the stream cancels the subscription.
pub type ChangeStream = BoxStream<'static, SyncResult<ChangeBatch>>;

/// Live feed of one document's state. Dropping the stream cancels it.
pub type SnapshotStream = BoxStream<'static, SyncResult<DocumentSnapshot>>;

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Subscribe to a query. The first batch holds the full current result.
    async fn subscribe(&self, query: &Query) -> SyncResult<ChangeStream>;

    /// Subscribe to one document. The first item is its current state.
    async fn subscribe_document(&self, reference: &DocRef) -> SyncResult<SnapshotStream>;

    async fn fetch_once(&self, reference: &DocRef) -> SyncResult<Option<RawDocument>>;

    async fn query(&self, query: &Query) -> SyncResult<Vec<RawDocument>>;

    async fn set(&self, reference: &DocRef, data: Value) -> SyncResult<()>;

    /// Merge `fields` into an existing document; fails if it does not exist.
    async fn update(&self, reference: &DocRef, fields: Map<String, Value>) -> SyncResult<()>;

    async fn delete(&self, reference: &DocRef) -> SyncResult<()>;

    /// Apply every queued write atomically.
    async fn commit(&self, batch: WriteBatch) -> SyncResult<()>;
}
