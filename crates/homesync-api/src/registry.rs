//! Entity-keyed subscriber registry.
//!
//! Subscribers are removed by `(entity_id, id)` rather than by position,
//! so concurrent add/remove never disturbs other registrations. Dispatch
//! works on a snapshot of the list, which lets handlers subscribe or
//! unsubscribe from inside a callback without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::wire::EntityState;

/// Callback invoked with `(entity_id, old_state, new_state)`.
pub type EntityHandler =
    Arc<dyn Fn(&str, Option<&EntityState>, Option<&EntityState>) + Send + Sync>;

#[derive(Clone)]
struct Entry {
    id: u64,
    handler: EntityHandler,
}

pub(crate) struct SubscriptionRegistry {
    entries: DashMap<String, Vec<Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler, returning its generation-numbered id.
    pub(crate) fn add(&self, entity_id: &str, handler: EntityHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .entry(entity_id.to_owned())
            .or_default()
            .push(Entry { id, handler });
        id
    }

    /// Remove exactly one registration. Returns `true` if it existed.
    pub(crate) fn remove(&self, entity_id: &str, id: u64) -> bool {
        let removed = {
            let Some(mut list) = self.entries.get_mut(entity_id) else {
                return false;
            };
            let before = list.len();
            list.retain(|entry| entry.id != id);
            before != list.len()
        };

        // Re-checked under the shard lock, so a concurrent `add` keeps its entry.
        self.entries.remove_if(entity_id, |_, list| list.is_empty());
        removed
    }

    /// Copy of the handlers for one entity, in registration order.
    pub(crate) fn snapshot(&self, entity_id: &str) -> Vec<EntityHandler> {
        self.entries
            .get(entity_id)
            .map(|list| list.iter().map(|entry| Arc::clone(&entry.handler)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn subscriber_count(&self, entity_id: &str) -> usize {
        self.entries.get(entity_id).map_or(0, |list| list.len())
    }

    pub(crate) fn entity_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}

/// Handle to one entity subscription.
///
/// Dropping the handle keeps the registration alive; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct EntitySubscription {
    entity_id: String,
    id: u64,
    registry: Weak<SubscriptionRegistry>,
}

impl EntitySubscription {
    pub(crate) fn new(entity_id: String, id: u64, registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            entity_id,
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove this registration. Other subscribers on the same entity are
    /// untouched. Returns `false` if it was already gone (for instance
    /// cleared by a disconnect).
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(&self.entity_id, self.id))
    }
}

impl std::fmt::Debug for EntitySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySubscription")
            .field("entity_id", &self.entity_id)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
