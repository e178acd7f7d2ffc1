//! In-process [`RemoteStore`] with fault injection.
//!
//! Documents live in an ordered map keyed by reference. Every write computes
//! per-subscriber diffs (Added/Modified/Removed) and pushes them down the
//! subscribers' channels, so caches see the same change feed shape a real
//! backend would send.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::utils::lock;

use super::{
    ChangeBatch, ChangeKind, ChangeStream, DocRef, DocumentChange, DocumentSnapshot, Query,
    RawDocument, RemoteStore, SnapshotStream, WriteBatch, WriteOp,
};

struct QuerySubscriber {
    query: Query,
    visible: BTreeSet<DocRef>,
    tx: UnboundedSender<SyncResult<ChangeBatch>>,
}

struct DocumentSubscriber {
    reference: DocRef,
    tx: UnboundedSender<SyncResult<DocumentSnapshot>>,
}

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<DocRef, Value>,
    query_subs: Vec<QuerySubscriber>,
    doc_subs: Vec<DocumentSubscriber>,
    failing_subscribes: u32,
    offline: bool,
}

#[derive(Default)]
struct StoreStats {
    subscribes: AtomicU64,
    fetches: AtomicU64,
    queries: AtomicU64,
    commits: AtomicU64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    stats: StoreStats,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document immediately, notifying subscribers.
    pub fn seed(&self, reference: DocRef, data: Value) {
        let mut state = lock(&self.state);
        // A set never fails validation.
        let _ = state.apply(vec![WriteOp::Set { reference, data }]);
    }

    pub fn document(&self, reference: &DocRef) -> Option<Value> {
        lock(&self.state).documents.get(reference).cloned()
    }

    /// Make the next `count` subscribe attempts fail with a transport error.
    pub fn fail_next_subscribes(&self, count: u32) {
        lock(&self.state).failing_subscribes = count;
    }

    /// While offline every call fails; going offline also breaks live feeds.
    pub fn set_offline(&self, offline: bool) {
        let mut state = lock(&self.state);
        state.offline = offline;
        if offline {
            state.break_all("store went offline");
        }
    }

    /// Push a transport error down every live subscription and close it.
    pub fn break_subscriptions(&self, reason: &str) {
        lock(&self.state).break_all(reason);
    }

    /// Subscriptions whose consumer is still attached.
    pub fn active_subscriptions(&self) -> usize {
        let state = lock(&self.state);
        state.query_subs.iter().filter(|s| !s.tx.is_closed()).count()
            + state.doc_subs.iter().filter(|s| !s.tx.is_closed()).count()
    }

    pub fn subscribe_count(&self) -> u64 {
        self.stats.subscribes.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> u64 {
        self.stats.fetches.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> u64 {
        self.stats.queries.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.stats.commits.load(Ordering::SeqCst)
    }

    fn check_online(state: &MemoryState) -> SyncResult<()> {
        if state.offline {
            return Err(SyncError::transport("store offline"));
        }
        Ok(())
    }

    fn check_subscribe(state: &mut MemoryState) -> SyncResult<()> {
        Self::check_online(state)?;
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(SyncError::transport("subscribe rejected"));
        }
        Ok(())
    }

    fn write(&self, ops: Vec<WriteOp>) -> SyncResult<()> {
        let mut state = lock(&self.state);
        Self::check_online(&state)?;
        state.apply(ops)
    }
}

impl MemoryState {
    fn matching(&self, query: &Query) -> Vec<RawDocument> {
        let matched = self
            .documents
            .iter()
            .filter(|(reference, data)| query.matches(reference, data))
            .map(|(reference, data)| RawDocument::new(reference.clone(), data.clone()));
        match query.max_results() {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        }
    }

    fn break_all(&mut self, reason: &str) {
        for sub in self.query_subs.drain(..) {
            let _ = sub.tx.unbounded_send(Err(SyncError::transport(reason)));
        }
        for sub in self.doc_subs.drain(..) {
            let _ = sub.tx.unbounded_send(Err(SyncError::transport(reason)));
        }
    }

    /// Stage all ops, then commit and fan out diffs. Nothing is applied if
    /// any op fails.
    fn apply(&mut self, ops: Vec<WriteOp>) -> SyncResult<()> {
        let mut staged = self.documents.clone();
        let mut touched: Vec<DocRef> = Vec::new();

        for op in ops {
            let reference = op.reference().clone();
            match op {
                WriteOp::Set { data, .. } => {
                    staged.insert(reference.clone(), data);
                }
                WriteOp::Update { fields, .. } => {
                    let existing = staged
                        .get_mut(&reference)
                        .ok_or_else(|| SyncError::NotFound(reference.clone()))?;
                    if !existing.is_object() {
                        *existing = Value::Object(Map::new());
                    }
                    if let Some(body) = existing.as_object_mut() {
                        body.extend(fields);
                    }
                }
                WriteOp::Delete { .. } => {
                    staged.remove(&reference);
                }
            }
            if !touched.contains(&reference) {
                touched.push(reference);
            }
        }

        let before = std::mem::replace(&mut self.documents, staged);
        self.notify(&before, &touched);
        Ok(())
    }

    fn notify(&mut self, before: &BTreeMap<DocRef, Value>, touched: &[DocRef]) {
        let documents = &self.documents;

        self.query_subs.retain_mut(|sub| {
            let mut changes = Vec::new();
            for reference in touched {
                let was_visible = sub.visible.contains(reference);
                let after = documents.get(reference);
                let matches_now = after
                    .map(|data| sub.query.matches(reference, data))
                    .unwrap_or(false);

                let kind = match (was_visible, matches_now) {
                    (true, true) => ChangeKind::Modified,
                    (true, false) => {
                        sub.visible.remove(reference);
                        ChangeKind::Removed
                    }
                    (false, true) => {
                        let full = sub
                            .query
                            .max_results()
                            .map(|limit| sub.visible.len() >= limit)
                            .unwrap_or(false);
                        if full {
                            continue;
                        }
                        sub.visible.insert(reference.clone());
                        ChangeKind::Added
                    }
                    (false, false) => continue,
                };

                let data = after
                    .or_else(|| before.get(reference))
                    .cloned()
                    .unwrap_or(Value::Null);
                changes.push(DocumentChange {
                    kind,
                    document: RawDocument::new(reference.clone(), data),
                });
            }
            if changes.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx.unbounded_send(Ok(ChangeBatch { changes })).is_ok()
        });

        self.doc_subs.retain(|sub| {
            if !touched.contains(&sub.reference) {
                return !sub.tx.is_closed();
            }
            let snapshot = DocumentSnapshot {
                reference: sub.reference.clone(),
                data: documents.get(&sub.reference).cloned(),
                read_time: Utc::now(),
            };
            sub.tx.unbounded_send(Ok(snapshot)).is_ok()
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn subscribe(&self, query: &Query) -> SyncResult<ChangeStream> {
        self.stats.subscribes.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        Self::check_subscribe(&mut state)?;

        let initial = state.matching(query);
        let visible = initial.iter().map(|doc| doc.reference.clone()).collect();
        let changes = initial
            .into_iter()
            .map(|document| DocumentChange {
                kind: ChangeKind::Added,
                document,
            })
            .collect();

        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(Ok(ChangeBatch { changes }));
        state.query_subs.push(QuerySubscriber {
            query: query.clone(),
            visible,
            tx,
        });
        debug!(query = %query, "Query subscription opened");
        Ok(rx.boxed())
    }

    async fn subscribe_document(&self, reference: &DocRef) -> SyncResult<SnapshotStream> {
        self.stats.subscribes.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        Self::check_subscribe(&mut state)?;

        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(Ok(DocumentSnapshot {
            reference: reference.clone(),
            data: state.documents.get(reference).cloned(),
            read_time: Utc::now(),
        }));
        state.doc_subs.push(DocumentSubscriber {
            reference: reference.clone(),
            tx,
        });
        debug!(reference = %reference, "Document subscription opened");
        Ok(rx.boxed())
    }

    async fn fetch_once(&self, reference: &DocRef) -> SyncResult<Option<RawDocument>> {
        self.stats.fetches.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        Self::check_online(&state)?;
        Ok(state
            .documents
            .get(reference)
            .map(|data| RawDocument::new(reference.clone(), data.clone())))
    }

    async fn query(&self, query: &Query) -> SyncResult<Vec<RawDocument>> {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        Self::check_online(&state)?;
        Ok(state.matching(query))
    }

    async fn set(&self, reference: &DocRef, data: Value) -> SyncResult<()> {
        self.write(vec![WriteOp::Set {
            reference: reference.clone(),
            data,
        }])
    }

    async fn update(&self, reference: &DocRef, fields: Map<String, Value>) -> SyncResult<()> {
        self.write(vec![WriteOp::Update {
            reference: reference.clone(),
            fields,
        }])
    }

    async fn delete(&self, reference: &DocRef) -> SyncResult<()> {
        self.write(vec![WriteOp::Delete {
            reference: reference.clone(),
        }])
    }

    async fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        self.write(batch.into_ops())
    }
}
