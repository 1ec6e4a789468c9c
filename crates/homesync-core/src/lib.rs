// homesync-core: Typed reactive state layer between homesync-api and consumers.

pub mod catalog;
pub mod error;
pub mod store;
pub mod value;

// ── Primary re-exports ──────────────────────────────────────────────
pub use catalog::{Catalog, STANDARD_VARIABLES, Seed, StateVariable, ValueKind};
pub use error::CoreError;
pub use store::{StateHandler, StateStore, StateSubscription, SyncReport};
pub use value::StateValue;
