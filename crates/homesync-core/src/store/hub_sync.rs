// ── Hub synchronization ──
//
// Hydrates the store from a bulk `get_states` snapshot, keeps it current
// from `state_changed` events, and pushes cached values back out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use homesync_api::{ConnectionState, EntityState};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::state_store::{StateStore, StoreInner};
use crate::catalog::StateVariable;
use crate::error::CoreError;
use crate::value::StateValue;

/// Per-variable outcome counts of one [`StateStore::sync_from_ha`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Hub-backed variables committed from the snapshot.
    pub synced: usize,
    /// Local-only variables seeded with their default.
    pub local_only: usize,
    /// Hub-backed variables whose entity the hub did not report.
    pub missing: usize,
    /// Hub-backed variables whose raw state failed to convert.
    pub failed: usize,
}

impl StateStore {
    /// Subscribe to live changes and bulk-hydrate the cache from the hub.
    ///
    /// Entity subscriptions are in place before the snapshot is
    /// requested, so a change landing mid-sync is applied either way.
    /// Every converted value is committed through the normal notify path,
    /// so subscribers see first hydration as a regular change. Missing or
    /// unconvertible entities are logged and skipped; only a failed bulk
    /// fetch is returned as an error.
    pub async fn sync_from_ha(&self) -> Result<SyncReport, CoreError> {
        info!("syncing state from hub");
        // Subscribe first so events racing the snapshot are not lost.
        *self.inner.live_during_sync.lock() = Some(HashSet::new());
        self.register_entity_subscriptions();
        let states = match self.inner.client.get_states().await {
            Ok(states) => states,
            Err(e) => {
                self.inner.live_during_sync.lock().take();
                return Err(e.into());
            }
        };
        let by_entity: HashMap<&str, &EntityState> =
            states.iter().map(|s| (s.entity_id.as_str(), s)).collect();

        let mut report = SyncReport::default();
        for var in self.inner.catalog.iter() {
            let Some(entity_id) = var.entity_id.filter(|_| !var.local_only) else {
                self.seed_default(var);
                report.local_only += 1;
                debug!(key = var.key, "local-only variable ready");
                continue;
            };

            let Some(state) = by_entity.get(entity_id) else {
                warn!(key = var.key, entity_id, "entity not reported by hub");
                report.missing += 1;
                continue;
            };

            match self.apply_snapshot_state(var, &state.state) {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!(key = var.key, entity_id, error = %e, "failed to convert hub state");
                    report.failed += 1;
                }
            }
        }

        self.inner.live_during_sync.lock().take();
        info!(
            synced = report.synced,
            local_only = report.local_only,
            missing = report.missing,
            failed = report.failed,
            total = self.inner.catalog.len(),
            "state sync complete"
        );
        Ok(report)
    }

    fn apply_hub_state(&self, var: &StateVariable, raw: &str) -> Result<(), CoreError> {
        let value = StateValue::from_hub_state(var.key, raw, var.kind())?;
        self.commit_from_hub(var, value);
        Ok(())
    }

    /// Commit a snapshot value unless a live event already superseded it.
    fn apply_snapshot_state(&self, var: &StateVariable, raw: &str) -> Result<(), CoreError> {
        let live = self.inner.live_during_sync.lock();
        if live.as_ref().is_some_and(|keys| keys.contains(var.key)) {
            trace!(key = var.key, "live event newer than snapshot, keeping it");
            return Ok(());
        }
        self.apply_hub_state(var, raw)
    }

    /// Commit a live event, recording it if a sync is in progress.
    fn apply_event_state(&self, var: &StateVariable, raw: &str) -> Result<(), CoreError> {
        let mut live = self.inner.live_during_sync.lock();
        self.apply_hub_state(var, raw)?;
        if let Some(keys) = live.as_mut() {
            keys.insert(var.key);
        }
        Ok(())
    }

    /// Replace the previous sync's entity subscriptions with one per
    /// hub-backed variable.
    fn register_entity_subscriptions(&self) {
        let mut subscriptions = self.inner.hub_subscriptions.lock();
        for stale in subscriptions.drain(..) {
            stale.unsubscribe();
        }

        for var in self.inner.catalog.iter().filter(|v| !v.local_only) {
            let Some(entity_id) = var.entity_id else {
                continue;
            };
            let store = Arc::downgrade(&self.inner);
            let var = *var;
            let sub = self
                .inner
                .client
                .subscribe_to_entity(entity_id, move |entity_id, _old, new| {
                    on_entity_changed(&store, &var, entity_id, new);
                });
            subscriptions.push(sub);
        }
    }

    // ── Outbound writes ──────────────────────────────────────────────

    /// Send the cached value of `key` to the hub.
    ///
    /// Uses the typed `input_*` helpers when the entity's domain matches
    /// the value kind, and a generic `turn_on`/`turn_off`/`set_value`
    /// service call otherwise. Structured values are sent as JSON text.
    /// Local-only variables are skipped.
    pub async fn push_to_hub(&self, key: &str) -> Result<(), CoreError> {
        let var = *self.variable(key)?;
        let Some((domain, name)) = var.entity_parts().filter(|_| !var.local_only) else {
            debug!(key, "local-only variable, nothing to push");
            return Ok(());
        };
        if self.is_read_only() {
            return Err(CoreError::ReadOnlyMode {
                key: key.to_owned(),
            });
        }

        let value = self.get(key)?;
        let client = &self.inner.client;
        debug!(key, entity_id = var.entity_id, value = %value, "pushing state to hub");

        match (&value, domain) {
            (StateValue::Bool(on), "input_boolean") => client.set_input_boolean(name, *on).await?,
            (StateValue::Number(n), "input_number") => client.set_input_number(name, *n).await?,
            (StateValue::Text(s), "input_text") => client.set_input_text(name, s).await?,
            (StateValue::Structured(v), "input_text") => {
                client.set_input_text(name, &v.to_string()).await?;
            }
            (StateValue::Bool(on), _) => {
                let service = if *on { "turn_on" } else { "turn_off" };
                client
                    .call_service(domain, service, entity_data(var.entity_id, None))
                    .await?;
            }
            (StateValue::Number(n), _) => {
                client
                    .call_service(domain, "set_value", entity_data(var.entity_id, Some(json!(n))))
                    .await?;
            }
            (StateValue::Text(s), _) => {
                client
                    .call_service(domain, "set_value", entity_data(var.entity_id, Some(json!(s))))
                    .await?;
            }
            (StateValue::Structured(v), _) => {
                let text = Value::String(v.to_string());
                client
                    .call_service(domain, "set_value", entity_data(var.entity_id, Some(text)))
                    .await?;
            }
        }
        Ok(())
    }

    // ── Reconnect handling ───────────────────────────────────────────

    /// Re-run [`sync_from_ha`](Self::sync_from_ha) every time the client
    /// comes back to `Connected` after losing its connection.
    ///
    /// Reconnecting clears the client's entity subscriptions, so without
    /// this the cache would silently go stale. Runs until `cancel` fires.
    pub fn spawn_resync(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let mut state = self.inner.client.connection_state();

        tokio::spawn(async move {
            let mut was_connected = *state.borrow_and_update() == ConnectionState::Connected;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                let connected = *state.borrow_and_update() == ConnectionState::Connected;
                if connected && !was_connected {
                    info!("hub connection restored, resyncing state");
                    if let Err(e) = store.sync_from_ha().await {
                        warn!(error = %e, "resync after reconnect failed");
                    }
                }
                was_connected = connected;
            }
        })
    }
}

fn on_entity_changed(
    store: &Weak<StoreInner>,
    var: &StateVariable,
    entity_id: &str,
    new: Option<&EntityState>,
) {
    let Some(new) = new else {
        trace!(entity_id, "entity removed, keeping cached value");
        return;
    };
    let Some(inner) = store.upgrade() else {
        return;
    };

    let store = StateStore { inner };
    if let Err(e) = store.apply_event_state(var, &new.state) {
        warn!(key = var.key, entity_id, error = %e, "failed to convert state change");
    }
}

fn entity_data(entity_id: Option<&str>, value: Option<Value>) -> Map<String, Value> {
    let mut data = Map::new();
    if let Some(entity_id) = entity_id {
        data.insert("entity_id".into(), Value::String(entity_id.to_owned()));
    }
    if let Some(value) = value {
        data.insert("value".into(), value);
    }
    data
}
