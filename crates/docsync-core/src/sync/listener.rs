//! Scoped listener registrations.

use std::fmt;

/// Keeps a listener or observer registered for as long as it is alive.
///
/// Dropping the handle (or calling [`release`](Self::release)) deregisters.
/// Releasing is idempotent and safe after the registry itself is gone.
#[must_use = "dropping the handle removes the listener immediately"]
pub struct ListenerHandle {
    id: u64,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub(crate) fn new(id: u64, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(mut self) {
        self.run_release();
    }

    /// Keep the registration for the registry's whole lifetime.
    pub fn persist(mut self) {
        self.release = None;
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}
