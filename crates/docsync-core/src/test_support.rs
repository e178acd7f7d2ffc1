//! Shared fixtures for the engine's unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::document::Document;
use crate::store::{DocRef, MemoryStore};
use crate::sync::{CacheEvent, Entity, EntityCache, ReferenceSetSync};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub refs: Vec<DocRef>,
}

impl Note {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }
}

impl Document for Note {
    const KIND: &'static str = "note";

    /// Keeps local tags when the server sends none.
    fn apply_update(&mut self, incoming: Self) {
        let tags = if incoming.tags.is_empty() {
            std::mem::take(&mut self.tags)
        } else {
            incoming.tags
        };
        *self = Note { tags, ..incoming };
    }
}

/// A payload owning a sub-cache keyed off its `friends` field.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub friends: Vec<DocRef>,
    #[serde(skip)]
    pub friends_sync: Option<ReferenceSetSync<Person>>,
}

impl Person {
    /// Attach a friends set resolved through `parent` and fill it from the
    /// entity's current friend list.
    pub fn attach_friends(
        entity: &Entity<Person>,
        parent: &EntityCache<Person>,
    ) -> ReferenceSetSync<Person> {
        let label = format!("{} friends", entity.id().unwrap_or_default());
        let sync = ReferenceSetSync::delegating(parent, label);
        entity.with_payload_mut(|person| {
            sync.update_references(&person.friends);
            person.friends_sync = Some(sync.clone());
        });
        sync
    }
}

impl Document for Person {
    const KIND: &'static str = "person";

    fn apply_update(&mut self, incoming: Self) {
        let friends_sync = self.friends_sync.take();
        *self = incoming;
        self.friends_sync = friends_sync;
        if let Some(sync) = &self.friends_sync {
            sync.update_references(&self.friends);
        }
    }
}

/// A context over a fresh in-memory store with the test kinds registered.
pub fn context_with_store() -> (SyncContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(store.clone(), SyncConfig::default());
    ctx.register_serde::<Note>();
    ctx.register_serde::<Person>();
    (ctx, store)
}

pub fn note(ctx: &SyncContext, id: &str, text: &str) -> Entity<Note> {
    Entity::from_snapshot(ctx, DocRef::new("notes", id), Note::text(text))
}

/// Records cache events as short strings such as `inserted:0:a`.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn listener<T: Document>(&self) -> impl Fn(&CacheEvent<T>) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event: &CacheEvent<T>| events.lock().unwrap().push(describe(event))
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

fn describe<T: Document>(event: &CacheEvent<T>) -> String {
    let id = |entity: &Entity<T>| entity.id().unwrap_or_default();
    match event {
        CacheEvent::Inserted { position, entity } => format!("inserted:{position}:{}", id(entity)),
        CacheEvent::Changed { position, entity } => format!("changed:{position}:{}", id(entity)),
        CacheEvent::Removed { position, entity } => format!("removed:{position}:{}", id(entity)),
        CacheEvent::Replaced { entities } => {
            let ids: Vec<String> = entities.iter().map(id).collect();
            format!("replaced:{}", ids.join(","))
        }
        CacheEvent::SizeChanged { size } => format!("size:{size}"),
    }
}

/// Poll `condition` until it holds. Under a paused clock each poll advances
/// virtual time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 10s");
}
