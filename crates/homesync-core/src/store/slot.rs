// ── Per-key value cell ──
//
// One slot per catalog key. The value, its revision, and its handler
// list share one lock so registering a listener and committing a value
// can never interleave into a missed or doubled notification. A second,
// reentrant lock is held for the whole commit-and-notify sequence: it
// keeps notifications for one key in commit order, and lets
// `remove_handler` wait out an in-flight dispatch on another thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use crate::value::StateValue;

/// Callback invoked with `(key, old_value, new_value)`.
///
/// `old_value` is `None` on the first commit for a key.
pub type StateHandler = Arc<dyn Fn(&str, Option<&StateValue>, &StateValue) + Send + Sync>;

/// Precondition for a commit.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Expect<'a> {
    Any,
    Current(&'a StateValue),
    Uninitialized,
}

/// Outcome of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commit {
    /// Stored a different value and notified handlers.
    Changed,
    /// Stored an equal value; no notification.
    Unchanged,
    /// The precondition did not hold; nothing stored.
    Mismatch,
    /// A `Current` precondition was checked against an empty slot.
    Uninitialized,
}

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: StateHandler,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Cell {
    value: Option<StateValue>,
    revision: u64,
    handlers: Vec<HandlerEntry>,
}

#[derive(Default)]
pub(crate) struct Slot {
    dispatch: ReentrantMutex<()>,
    cell: Mutex<Cell>,
}

impl Slot {
    pub(crate) fn value(&self) -> Option<StateValue> {
        self.cell.lock().value.clone()
    }

    pub(crate) fn revision(&self) -> u64 {
        self.cell.lock().revision
    }

    pub(crate) fn commit(&self, key: &str, value: StateValue, expect: Expect<'_>) -> Commit {
        let _dispatch = self.dispatch.lock();

        let (old, handlers) = {
            let mut cell = self.cell.lock();
            match (expect, &cell.value) {
                (Expect::Current(_), None) => return Commit::Uninitialized,
                (Expect::Current(expected), Some(current)) if current != expected => {
                    return Commit::Mismatch;
                }
                (Expect::Uninitialized, Some(_)) => return Commit::Mismatch,
                _ => {}
            }

            cell.revision += 1;
            if cell.value.as_ref() == Some(&value) {
                return Commit::Unchanged;
            }
            let old = cell.value.replace(value.clone());
            (old, cell.handlers.clone())
        };

        debug!(
            key,
            old = %old.as_ref().map_or_else(|| "<unset>".to_owned(), ToString::to_string),
            new = %value,
            "state changed"
        );

        for entry in &handlers {
            // Unsubscribed from inside an earlier handler of this dispatch.
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (entry.handler)(key, old.as_ref(), &value);
            }));
            if outcome.is_err() {
                warn!(key, handler_id = entry.id, "state handler panicked");
            }
        }

        Commit::Changed
    }

    /// Register a handler and return the value it starts from. Any
    /// commit not reflected in that value will notify the handler.
    pub(crate) fn add_handler(&self, id: u64, handler: StateHandler) -> Option<StateValue> {
        let mut cell = self.cell.lock();
        cell.handlers.push(HandlerEntry {
            id,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });
        cell.value.clone()
    }

    /// Remove one handler. Once this returns the handler will not be
    /// invoked again, even by a dispatch already in progress.
    pub(crate) fn remove_handler(&self, id: u64) -> bool {
        let _dispatch = self.dispatch.lock();
        let mut cell = self.cell.lock();
        let before = cell.handlers.len();
        cell.handlers.retain(|entry| {
            if entry.id == id {
                entry.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        before != cell.handlers.len()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.cell.lock().handlers.len()
    }
}
