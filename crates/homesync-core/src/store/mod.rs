// ── Reactive state store ──
//
// Typed per-key cells with synchronous change notification, hydrated
// from and written back to the hub.

mod hub_sync;
mod slot;
mod state_store;

pub use hub_sync::SyncReport;
pub use slot::StateHandler;
pub use state_store::{StateStore, StateSubscription};
