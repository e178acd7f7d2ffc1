//! Example entity schemas wired into the demo.

use docsync_core::store::DocRef;
use docsync_core::{Document, Entity, EntityCache, ReferenceSetSync};
use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub friends: Vec<DocRef>,
    /// Resolved friends, kept in step with `friends` by `apply_update`.
    #[serde(skip)]
    pub friends_sync: Option<ReferenceSetSync<User>>,
}

impl User {
    /// Give `entity` a friends set resolved through `users`, seeded from its
    /// current friend list.
    pub fn attach_friends(entity: &Entity<User>, users: &EntityCache<User>) -> ReferenceSetSync<User> {
        let label = format!("friends of {}", entity.id().unwrap_or_default());
        let sync = ReferenceSetSync::delegating(users, label);
        entity.with_payload_mut(|user| {
            sync.update_references(&user.friends);
            user.friends_sync = Some(sync.clone());
        });
        sync
    }
}

impl Document for User {
    const KIND: &'static str = "user";

    fn apply_update(&mut self, incoming: Self) {
        let friends_sync = self.friends_sync.take();
        *self = incoming;
        self.friends_sync = friends_sync;
        if let Some(sync) = &self.friends_sync {
            sync.update_references(&self.friends);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notification {
    pub user: Option<DocRef>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub read: bool,
}

impl Document for Notification {
    const KIND: &'static str = "notification";
}
