//! Per-flow mutable hub.
//!
//! A single mutable bag avoids threading state through deep call chains.
//! Nothing stored here is random or wall-clock-derived, so its contents
//! reconstruct deterministically when a flow is replayed. Teardown is the
//! flow completion hook's job; the bag is scoped to one flow, never
//! process-wide.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::dev_run::DevRunInstance;
use crate::interaction::UserAction;

type CancelFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    paused: bool,
    pending_user_action: Option<UserAction>,
    string_values: HashMap<String, String>,
    typed_values: HashMap<String, Value>,
    cancel_fns: Vec<CancelFn>,
    dev_runs: HashMap<String, DevRunInstance>,
}

/// Thread-safe key/value state for the current flow: pause flag, pending
/// user action, current branches, dev-run registry, arbitrary scoped values.
#[derive(Default)]
pub struct GlobalState {
    inner: Mutex<Inner>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Pause flag ───────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    // ── Pending user action ──────────────────────────────────────────────

    pub fn set_user_action(&self, action: UserAction) {
        self.inner.lock().pending_user_action = Some(action);
    }

    pub fn pending_user_action(&self) -> Option<UserAction> {
        self.inner.lock().pending_user_action.clone()
    }

    /// Take the pending action, leaving none. Atomic with respect to a
    /// concurrent `set_user_action`.
    pub fn consume_pending_user_action(&self) -> Option<UserAction> {
        self.inner.lock().pending_user_action.take()
    }

    // ── Scoped values ────────────────────────────────────────────────────

    pub fn set_string_value(&self, key: &str, value: impl Into<String>) {
        self.inner
            .lock()
            .string_values
            .insert(key.to_string(), value.into());
    }

    pub fn string_value(&self, key: &str) -> Option<String> {
        self.inner.lock().string_values.get(key).cloned()
    }

    pub fn set_value(&self, key: &str, value: Value) {
        self.inner
            .lock()
            .typed_values
            .insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.lock().typed_values.get(key).cloned()
    }

    // ── Cancel functions ─────────────────────────────────────────────────

    pub fn add_cancel_fn(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.lock().cancel_fns.push(Box::new(f));
    }

    /// Drain and invoke queued cancel functions in FIFO order, clearing the
    /// queue. Safe to call repeatedly; an empty queue is a no-op.
    pub fn cancel(&self) {
        let fns: Vec<CancelFn> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.cancel_fns)
        };
        for f in fns {
            f();
        }
    }

    // ── Dev-run registry ─────────────────────────────────────────────────

    pub fn insert_dev_run(&self, instance: DevRunInstance) {
        self.inner
            .lock()
            .dev_runs
            .insert(instance.command_id.clone(), instance);
    }

    pub fn dev_run(&self, command_id: &str) -> Option<DevRunInstance> {
        self.inner.lock().dev_runs.get(command_id).cloned()
    }

    pub fn remove_dev_run(&self, command_id: &str) -> Option<DevRunInstance> {
        self.inner.lock().dev_runs.remove(command_id)
    }

    /// Snapshot of all live runs, for the `dev_run_state` query.
    pub fn dev_runs(&self) -> HashMap<String, DevRunInstance> {
        self.inner.lock().dev_runs.clone()
    }

    /// Cleared on flow completion along with everything else.
    pub fn clear_dev_runs(&self) {
        self.inner.lock().dev_runs.clear();
    }
}
