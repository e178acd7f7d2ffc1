//! Caches whose membership follows a list of document references.
//!
//! The owning entity pushes its current reference list through
//! [`ReferenceSetSync::update_references`] whenever its own payload changes.
//! Each update drops members that are no longer referenced, then resolves
//! the missing ones, either with a watching entity per reference or by
//! asking a parent cache that already follows those documents.
//!
//! Readiness holds while the member count equals the number of references
//! last supplied. It is not evaluated during the removal pass, so shrinking a
//! stale set down to the new count never reports a half-resolved set as
//! complete.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::context::SyncContext;
use crate::document::Document;
use crate::store::DocRef;
use crate::utils::lock;

use super::cache::{CacheShared, EntityCache, IdEvent, Readiness};
use super::listener::ListenerHandle;

/// How repeated references count towards the required cardinality.
///
/// Repeats are compared as full references. Distinct references that share
/// an id count separately, but only one of them can be a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// A repeated reference is one member; readiness needs each distinct
    /// document once.
    #[default]
    Collapse,
    /// Every entry counts. A cache holds one entity per id, so a list with
    /// repeats never becomes ready.
    CountEach,
}

enum Resolution<T: Document> {
    Independent,
    Delegating(Weak<CacheShared<T>>),
}

#[derive(Default)]
struct RefsState {
    references: Vec<DocRef>,
    required: usize,
    duplicates: DuplicatePolicy,
    /// Delegated requests on the parent, by reference.
    links: HashMap<DocRef, ListenerHandle>,
}

struct RefsInner<T: Document> {
    resolution: Resolution<T>,
    update_gate: Mutex<()>,
    state: Mutex<RefsState>,
}

pub struct ReferenceSetSync<T: Document> {
    cache: EntityCache<T>,
    inner: Arc<RefsInner<T>>,
}

impl<T: Document> Clone for ReferenceSetSync<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Document> Deref for ReferenceSetSync<T> {
    type Target = EntityCache<T>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl<T: Document> ReferenceSetSync<T> {
    /// Resolve every reference with its own watching entity.
    pub fn independent(ctx: &SyncContext, label: impl Into<String>) -> Self {
        Self::build(
            EntityCache::with_readiness(ctx, label, None, unresolved()),
            Resolution::Independent,
        )
    }

    /// Resolve through `parent`, sharing its subscriptions. Removing a member
    /// leaves the parent's entity untouched.
    pub fn delegating(parent: &EntityCache<T>, label: impl Into<String>) -> Self {
        Self::build(
            EntityCache::with_readiness(parent.context(), label, None, unresolved()),
            Resolution::Delegating(parent.downgrade()),
        )
    }

    fn build(cache: EntityCache<T>, resolution: Resolution<T>) -> Self {
        Self {
            cache,
            inner: Arc::new(RefsInner {
                resolution,
                update_gate: Mutex::new(()),
                state: Mutex::new(RefsState::default()),
            }),
        }
    }

    pub fn with_duplicates(self, policy: DuplicatePolicy) -> Self {
        lock(&self.inner.state).duplicates = policy;
        self
    }

    pub fn cache(&self) -> &EntityCache<T> {
        &self.cache
    }

    /// The reference list last supplied.
    pub fn references(&self) -> Vec<DocRef> {
        lock(&self.inner.state).references.clone()
    }

    pub fn required(&self) -> usize {
        lock(&self.inner.state).required
    }

    pub fn is_delegating(&self) -> bool {
        matches!(self.inner.resolution, Resolution::Delegating(_))
    }

    /// Bring membership in line with `references`.
    pub fn update_references(&self, references: &[DocRef]) {
        let _serial = lock(&self.inner.update_gate);

        let mut seen = HashSet::new();
        let distinct: Vec<DocRef> = references
            .iter()
            .filter(|reference| seen.insert((*reference).clone()))
            .cloned()
            .collect();
        let required = {
            let mut state = lock(&self.inner.state);
            state.references = references.to_vec();
            state.required = match state.duplicates {
                DuplicatePolicy::Collapse => distinct.len(),
                DuplicatePolicy::CountEach => references.len(),
            };
            state.required
        };
        debug!(
            cache = %self.cache.label(),
            references = references.len(),
            required,
            "Updating reference set"
        );

        self.cache.set_suspended(true);
        self.cache.set_required(required);
        self.drop_unreferenced(&seen);
        self.cache.set_suspended(false);

        let revision = self.cache.revision();
        for reference in &distinct {
            self.resolve(reference);
        }
        // Puts during resolution already evaluated readiness.
        if self.cache.revision() == revision {
            self.cache.check_ready();
        }
    }

    /// Drop every member and in-flight resolution.
    pub fn clear(&self) {
        let _serial = lock(&self.inner.update_gate);
        let links = {
            let mut state = lock(&self.inner.state);
            state.references.clear();
            state.required = 0;
            std::mem::take(&mut state.links)
        };
        drop(links);
        for id in self.cache.pending_ids() {
            self.cache.cancel_pending(&id);
        }
        self.cache.set_required(0);
        let removed = self.cache.clear();
        if !self.is_delegating() {
            for entity in removed {
                entity.detach();
            }
        }
    }

    fn drop_unreferenced(&self, keep: &HashSet<DocRef>) {
        let stale_links: Vec<ListenerHandle> = {
            let mut state = lock(&self.inner.state);
            let stale: Vec<DocRef> = state
                .links
                .keys()
                .filter(|reference| !keep.contains(*reference))
                .cloned()
                .collect();
            stale
                .iter()
                .filter_map(|reference| state.links.remove(reference))
                .collect()
        };
        drop(stale_links);

        for reference in self.cache.pending_references() {
            if !keep.contains(&reference) {
                self.cache.cancel_pending(reference.id());
            }
        }

        for entity in self.cache.entities() {
            let Some(reference) = entity.reference() else {
                continue;
            };
            if keep.contains(&reference) {
                continue;
            }
            if let Some(entity) = self.cache.remove(reference.id()) {
                if !self.is_delegating() {
                    entity.detach();
                }
            }
        }
    }

    fn resolve(&self, reference: &DocRef) {
        let id = reference.id();
        match &self.inner.resolution {
            Resolution::Independent => {
                if !self.cache.contains(id) && !self.cache.is_pending(id) {
                    self.cache.ensure_watcher(reference);
                }
            }
            Resolution::Delegating(parent) => {
                if lock(&self.inner.state).links.contains_key(reference) {
                    return;
                }
                let Some(parent) = parent.upgrade().map(EntityCache::from_shared) else {
                    warn!(cache = %self.cache.label(), reference = %reference, "Parent cache is gone");
                    return;
                };
                let member = self.cache.downgrade();
                let handle = parent.request_listen(reference, move |event| {
                    let Some(shared) = member.upgrade() else {
                        return;
                    };
                    let cache = EntityCache::from_shared(shared);
                    match event {
                        IdEvent::Present(entity) => {
                            if let Err(e) = cache.put_observed(entity.clone()) {
                                warn!(cache = %cache.label(), error = %e, "Could not add member");
                            }
                        }
                        IdEvent::Removed(id) => {
                            cache.remove(id);
                        }
                    }
                });
                lock(&self.inner.state).links.insert(reference.clone(), handle);
            }
        }
    }
}

/// Nothing supplied yet: not ready until the first reference list arrives.
fn unresolved() -> Readiness {
    Readiness::Latch { fired: false }
}
