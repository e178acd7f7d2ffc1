//! The typed payload contract for synchronized entities.

/// A typed document payload.
///
/// `KIND` is the type tag the [`SyncContext`](crate::SyncContext) decoder
/// registry is keyed by. `apply_update` is the merge contract used whenever a
/// newer server value arrives for an entity that already holds a payload.
///
/// Payloads that own a [`ReferenceSetSync`](crate::ReferenceSetSync) keyed off
/// one of their fields must push the new reference list into it from
/// `apply_update`, so observers never see the field and the sub-cache out of
/// step.
pub trait Document: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn apply_update(&mut self, incoming: Self) {
        *self = incoming;
    }
}
