use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{BridgeError, Result};
use crate::subscription::set_path;
use crate::types::{Action, State};

pub type ChangeCallback = Box<dyn Fn(&State) + Send + Sync>;

/// The authoritative state the bridge coordinates access to.
///
/// The store owns the mutation logic; the bridge only decides when actions
/// reach it and who hears about the result.
pub trait StateStore: Send + Sync + 'static {
    fn get_state(&self) -> State;

    /// Apply one action and return the resulting state.
    fn apply_action(&self, action: &Action) -> Result<State>;

    /// Register `callback` for every state change. The returned handle
    /// unsubscribes when dropped.
    fn subscribe_to_changes(&self, callback: ChangeCallback) -> StoreSubscription;
}

// ---------------------------------------------------------------------------
// StoreSubscription
// ---------------------------------------------------------------------------

/// Keeps a change callback registered for as long as it lives.
pub struct StoreSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StoreSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

pub type Reducer = dyn Fn(&State, &Action) -> Result<State> + Send + Sync;

type Listeners = Arc<Mutex<BTreeMap<u64, Arc<ChangeCallback>>>>;

/// Reducer-driven in-memory store.
pub struct MemoryStore {
    state: Mutex<State>,
    reducer: Box<Reducer>,
    listeners: Listeners,
    next_listener: AtomicU64,
}

impl MemoryStore {
    pub fn new(
        initial: State,
        reducer: impl Fn(&State, &Action) -> Result<State> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(initial),
            reducer: Box::new(reducer),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// A store holding `{ "counter": initial }` driven by [`counter_reducer`].
    pub fn counter(initial: i64) -> Self {
        Self::new(json!({ "counter": initial }), counter_reducer)
    }

    fn notify(&self, state: &State) {
        let listeners: Vec<Arc<ChangeCallback>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

impl StateStore for MemoryStore {
    fn get_state(&self) -> State {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_action(&self, action: &Action) -> Result<State> {
        let (next, changed) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let next = (self.reducer)(&state, action)?;
            let changed = next != *state;
            *state = next.clone();
            (next, changed)
        };
        if changed {
            self.notify(&next);
        }
        Ok(next)
    }

    fn subscribe_to_changes(&self, callback: ChangeCallback) -> StoreSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));

        let listeners = Arc::downgrade(&self.listeners);
        StoreSubscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// counter_reducer
// ---------------------------------------------------------------------------

fn counter_of(state: &State) -> i64 {
    state.get("counter").and_then(Value::as_i64).unwrap_or(0)
}

fn payload_i64(action: &Action) -> Option<i64> {
    match &action.payload {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::Object(map)) => map.get("value").and_then(Value::as_i64),
        _ => None,
    }
}

fn overflow(counter: i64, op: &str, step: i64) -> BridgeError {
    BridgeError::ApplyActionFailed(format!("counter overflow: {counter} {op} {step}"))
}

fn with_counter(state: &State, value: i64) -> State {
    let mut next = state.clone();
    set_path(&mut next, "counter", json!(value));
    next
}

/// Reducer for the demo counter plus generic state writes.
///
/// | type                | effect                                          |
/// |---------------------|-------------------------------------------------|
/// | `counter:increment` | `counter += payload` (default 1)                |
/// | `counter:decrement` | `counter -= payload` (default 1)                |
/// | `counter:set`       | `counter = payload`                             |
/// | `counter:double`    | `counter *= 2`                                  |
/// | `counter:halve`     | `counter /= 2` (integer division)               |
/// | `state:set`         | write `payload.value` at dotted `payload.key`   |
/// | `state:merge`       | shallow-merge the payload object into the root  |
pub fn counter_reducer(state: &State, action: &Action) -> Result<State> {
    let counter = counter_of(state);
    let next = match action.action_type.as_str() {
        "counter:increment" => {
            let step = payload_i64(action).unwrap_or(1);
            let value = counter
                .checked_add(step)
                .ok_or_else(|| overflow(counter, "+", step))?;
            with_counter(state, value)
        }
        "counter:decrement" => {
            let step = payload_i64(action).unwrap_or(1);
            let value = counter
                .checked_sub(step)
                .ok_or_else(|| overflow(counter, "-", step))?;
            with_counter(state, value)
        }
        "counter:set" => {
            let value = payload_i64(action).ok_or_else(|| {
                BridgeError::ApplyActionFailed("counter:set needs an integer payload".into())
            })?;
            with_counter(state, value)
        }
        "counter:double" => with_counter(state, counter.saturating_mul(2)),
        "counter:halve" => with_counter(state, counter / 2),
        "state:set" => {
            let payload = action.payload.as_ref();
            let key = payload
                .and_then(|p| p.get("key"))
                .and_then(Value::as_str)
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    BridgeError::ApplyActionFailed("state:set needs a string 'key'".into())
                })?;
            let value = payload
                .and_then(|p| p.get("value"))
                .cloned()
                .unwrap_or(Value::Null);
            let mut next = state.clone();
            set_path(&mut next, key, value);
            next
        }
        "state:merge" => {
            let Some(Value::Object(patch)) = &action.payload else {
                return Err(BridgeError::ApplyActionFailed(
                    "state:merge needs an object payload".into(),
                ));
            };
            let mut next = state.clone();
            for (key, value) in patch {
                set_path(&mut next, key, value.clone());
            }
            next
        }
        other => {
            return Err(BridgeError::ApplyActionFailed(format!(
                "unknown action type '{other}'"
            )))
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn apply(store: &MemoryStore, kind: &str) -> State {
        store.apply_action(&Action::new(kind)).unwrap()
    }

    #[test]
    fn counter_sequence() {
        let store = MemoryStore::counter(2);
        assert_eq!(apply(&store, "counter:double")["counter"], 4);
        assert_eq!(apply(&store, "counter:increment")["counter"], 5);
        assert_eq!(apply(&store, "counter:double")["counter"], 10);
        assert_eq!(apply(&store, "counter:halve")["counter"], 5);
        assert_eq!(apply(&store, "counter:decrement")["counter"], 4);
        assert_eq!(store.get_state(), json!({ "counter": 4 }));
    }

    #[test]
    fn counter_overflow_is_an_apply_failure() {
        let store = MemoryStore::counter(2);
        let err = store
            .apply_action(&Action::new("counter:increment").with_payload(json!(i64::MAX)))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ApplyActionFailed(_)));

        let store = MemoryStore::counter(-2);
        let err = store
            .apply_action(&Action::new("counter:decrement").with_payload(json!(i64::MAX)))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ApplyActionFailed(_)));
        assert_eq!(store.get_state(), json!({ "counter": -2 }));
    }

    #[test]
    fn counter_set_reads_payload() {
        let store = MemoryStore::counter(0);
        let state = store
            .apply_action(&Action::new("counter:set").with_payload(json!(8)))
            .unwrap();
        assert_eq!(state["counter"], 8);

        let state = store
            .apply_action(&Action::new("counter:set").with_payload(json!({ "value": 3 })))
            .unwrap();
        assert_eq!(state["counter"], 3);

        let err = store.apply_action(&Action::new("counter:set")).unwrap_err();
        assert!(matches!(err, BridgeError::ApplyActionFailed(_)));
    }

    #[test]
    fn generic_set_and_merge() {
        let store = MemoryStore::new(json!({}), counter_reducer);
        store
            .apply_action(
                &Action::new("state:set")
                    .with_payload(json!({ "key": "user.profile.name", "value": "ada" })),
            )
            .unwrap();
        let state = store
            .apply_action(&Action::new("state:merge").with_payload(json!({ "theme": "dark" })))
            .unwrap();
        assert_eq!(
            state,
            json!({ "user": { "profile": { "name": "ada" } }, "theme": "dark" })
        );
    }

    #[test]
    fn unknown_action_is_rejected_and_state_kept() {
        let store = MemoryStore::counter(1);
        let err = store.apply_action(&Action::new("launch")).unwrap_err();
        assert!(err.to_string().contains("unknown action type"));
        assert_eq!(store.get_state()["counter"], 1);
    }

    #[test]
    fn listeners_fire_on_change_until_dropped() {
        let store = MemoryStore::counter(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let sub = store.subscribe_to_changes(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        apply(&store, "counter:increment");
        store
            .apply_action(&Action::new("counter:set").with_payload(json!(1)))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no-op write does not notify");

        drop(sub);
        apply(&store, "counter:increment");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
