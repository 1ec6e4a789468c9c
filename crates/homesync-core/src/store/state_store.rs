// ── State store ──
//
// Typed cache of the catalog's variables with optimistic concurrency and
// per-key change notification. Reads and writes never touch the network;
// outbound writes go through `push_to_hub`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use homesync_api::{EntitySubscription, HubClient};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::slot::{Commit, Expect, Slot, StateHandler};
use crate::catalog::{Catalog, StateVariable, ValueKind};
use crate::error::CoreError;
use crate::value::StateValue;

/// The reactive state store.
///
/// Cheaply cloneable; all clones share one cache. Construction fixes the
/// catalog and the read-only flag for the store's lifetime.
#[derive(Clone)]
pub struct StateStore {
    pub(super) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(super) client: HubClient,
    pub(super) catalog: Catalog,
    read_only: bool,
    slots: HashMap<&'static str, Slot>,
    next_handler_id: AtomicU64,
    /// Entity subscriptions registered by the last hub sync.
    pub(super) hub_subscriptions: Mutex<Vec<EntitySubscription>>,
    /// Keys updated by live events while a sync is running; the sync's
    /// older snapshot must not overwrite them.
    pub(super) live_during_sync: Mutex<Option<HashSet<&'static str>>>,
}

impl StateStore {
    pub fn new(client: HubClient, catalog: Catalog, read_only: bool) -> Self {
        let slots = catalog.iter().map(|v| (v.key, Slot::default())).collect();
        Self {
            inner: Arc::new(StoreInner {
                client,
                catalog,
                read_only,
                slots,
                next_handler_id: AtomicU64::new(1),
                hub_subscriptions: Mutex::new(Vec::new()),
                live_during_sync: Mutex::new(None),
            }),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn client(&self) -> &HubClient {
        &self.inner.client
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get_bool(&self, key: &str) -> Result<bool, CoreError> {
        self.read(key, ValueKind::Bool, StateValue::as_bool)
    }

    pub fn get_number(&self, key: &str) -> Result<f64, CoreError> {
        self.read(key, ValueKind::Number, StateValue::as_number)
    }

    pub fn get_string(&self, key: &str) -> Result<String, CoreError> {
        self.read(key, ValueKind::String, |v| v.as_text().map(str::to_owned))
    }

    pub fn get_structured(&self, key: &str) -> Result<Value, CoreError> {
        self.read(key, ValueKind::Structured, |v| v.as_structured().cloned())
    }

    /// Decode a structured variable into `T`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, CoreError> {
        let value = self.get_structured(key)?;
        serde_json::from_value(value).map_err(|e| CoreError::Serialization {
            key: key.to_owned(),
            message: e.to_string(),
        })
    }

    /// Current value of any kind.
    pub fn get(&self, key: &str) -> Result<StateValue, CoreError> {
        self.slot(key)?.value().ok_or_else(|| CoreError::NotInitialized {
            key: key.to_owned(),
        })
    }

    /// Snapshot of every initialized variable.
    pub fn get_all_values(&self) -> BTreeMap<String, StateValue> {
        self.inner
            .catalog
            .iter()
            .filter_map(|var| {
                let value = self.inner.slots.get(var.key)?.value()?;
                Some((var.key.to_owned(), value))
            })
            .collect()
    }

    /// Number of commits accepted for `key`; 0 if never written.
    pub fn revision(&self, key: &str) -> Result<u64, CoreError> {
        Ok(self.slot(key)?.revision())
    }

    fn read<T>(
        &self,
        key: &str,
        kind: ValueKind,
        extract: impl FnOnce(&StateValue) -> Option<T>,
    ) -> Result<T, CoreError> {
        let var = self.variable(key)?;
        if var.kind() != kind {
            return Err(CoreError::TypeMismatch {
                key: key.to_owned(),
                expected: var.kind(),
                actual: kind,
            });
        }
        let value = self.get(key)?;
        extract(&value).ok_or_else(|| CoreError::TypeMismatch {
            key: key.to_owned(),
            expected: kind,
            actual: value.kind(),
        })
    }

    // ── Writes ───────────────────────────────────────────────────────

    pub fn set_bool(&self, key: &str, value: bool) -> Result<(), CoreError> {
        self.set(key, StateValue::Bool(value))
    }

    pub fn set_number(&self, key: &str, value: f64) -> Result<(), CoreError> {
        self.set(key, StateValue::Number(value))
    }

    pub fn set_string(&self, key: &str, value: impl Into<String>) -> Result<(), CoreError> {
        self.set(key, StateValue::Text(value.into()))
    }

    pub fn set_structured(&self, key: &str, value: Value) -> Result<(), CoreError> {
        self.set(key, StateValue::Structured(value))
    }

    /// Encode `value` as JSON and store it in a structured variable.
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CoreError> {
        let encoded = serde_json::to_value(value).map_err(|e| CoreError::Serialization {
            key: key.to_owned(),
            message: e.to_string(),
        })?;
        self.set_structured(key, encoded)
    }

    /// Store `value`, notifying subscribers if it differs from the
    /// current one. Subscribers have run by the time this returns.
    pub fn set(&self, key: &str, value: StateValue) -> Result<(), CoreError> {
        self.write(key, value, Expect::Any).map(drop)
    }

    /// Set `key` to `new` only if it currently holds `expected`.
    ///
    /// Returns `Ok(false)` without mutating or notifying when the current
    /// value differs. Of several concurrent callers racing on the same
    /// expectation, exactly one wins.
    pub fn compare_and_swap_bool(
        &self,
        key: &str,
        expected: bool,
        new: bool,
    ) -> Result<bool, CoreError> {
        let expected = StateValue::Bool(expected);
        match self.write(key, StateValue::Bool(new), Expect::Current(&expected))? {
            Commit::Changed | Commit::Unchanged => Ok(true),
            Commit::Mismatch => Ok(false),
            Commit::Uninitialized => Err(CoreError::NotInitialized {
                key: key.to_owned(),
            }),
        }
    }

    fn write(&self, key: &str, value: StateValue, expect: Expect<'_>) -> Result<Commit, CoreError> {
        let var = self.variable(key)?;
        if var.kind() != value.kind() {
            return Err(CoreError::TypeMismatch {
                key: key.to_owned(),
                expected: var.kind(),
                actual: value.kind(),
            });
        }
        if self.inner.read_only && !var.local_only {
            return Err(CoreError::ReadOnlyMode {
                key: key.to_owned(),
            });
        }
        Ok(self.slot(key)?.commit(var.key, value, expect))
    }

    /// Commit a value that originated at the hub. Bypasses the
    /// read-only check; mirroring the hub is always allowed.
    pub(super) fn commit_from_hub(&self, var: &StateVariable, value: StateValue) -> Commit {
        self.inner
            .slots
            .get(var.key)
            .map_or(Commit::Mismatch, |slot| slot.commit(var.key, value, Expect::Any))
    }

    /// Seed a variable with its default unless it already has a value.
    pub(super) fn seed_default(&self, var: &StateVariable) -> Commit {
        self.inner.slots.get(var.key).map_or(Commit::Mismatch, |slot| {
            slot.commit(var.key, var.default.to_value(), Expect::Uninitialized)
        })
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register `handler` for every value-changing commit to `key`,
    /// whether it came from a local `set_*` or from the hub.
    pub fn subscribe<F>(&self, key: &str, handler: F) -> Result<StateSubscription, CoreError>
    where
        F: Fn(&str, Option<&StateValue>, &StateValue) + Send + Sync + 'static,
    {
        self.subscribe_with_current(key, handler).map(|(sub, _)| sub)
    }

    /// Like [`subscribe`](Self::subscribe), but also returns the value the
    /// handler starts from (`None` if uninitialized).
    ///
    /// Reading and registering happen atomically: every commit not
    /// reflected in the returned value reaches the handler. Use this
    /// instead of a `get_*` followed by `subscribe`.
    pub fn subscribe_with_current<F>(
        &self,
        key: &str,
        handler: F,
    ) -> Result<(StateSubscription, Option<StateValue>), CoreError>
    where
        F: Fn(&str, Option<&StateValue>, &StateValue) + Send + Sync + 'static,
    {
        let slot = self.slot(key)?;
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: StateHandler = Arc::new(handler);
        let current = slot.add_handler(id, handler);

        let sub = StateSubscription {
            key: key.to_owned(),
            id,
            store: Arc::downgrade(&self.inner),
        };
        Ok((sub, current))
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.slots.get(key).map_or(0, Slot::handler_count)
    }

    // ── Lookup helpers ───────────────────────────────────────────────

    pub(super) fn variable(&self, key: &str) -> Result<&StateVariable, CoreError> {
        self.inner.catalog.get(key).ok_or_else(|| CoreError::UnknownKey {
            key: key.to_owned(),
        })
    }

    fn slot(&self, key: &str) -> Result<&Slot, CoreError> {
        self.inner.slots.get(key).ok_or_else(|| CoreError::UnknownKey {
            key: key.to_owned(),
        })
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("variables", &self.inner.catalog.len())
            .field("read_only", &self.inner.read_only)
            .finish_non_exhaustive()
    }
}

// ── StateSubscription ────────────────────────────────────────────────

/// Handle to one [`StateStore::subscribe`] registration.
///
/// Dropping the handle does not unsubscribe.
pub struct StateSubscription {
    key: String,
    id: u64,
    store: Weak<StoreInner>,
}

impl StateSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove this registration. After this returns the handler is never
    /// invoked again. Returns `false` if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        self.store.upgrade().is_some_and(|inner| {
            inner
                .slots
                .get(self.key.as_str())
                .is_some_and(|slot| slot.remove_handler(self.id))
        })
    }
}

impl std::fmt::Debug for StateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSubscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
