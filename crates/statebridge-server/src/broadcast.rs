use statebridge_core::protocol::{ServerMessage, StateUpdate};
use statebridge_core::subscription::{changed_paths, serialize_with_depth};
use statebridge_core::transport::ServerSender;
use statebridge_core::{ConsumerId, State, SubscriptionManager, ThunkId, UpdateId, UpdateTracker};
use std::collections::HashMap;
use tracing::debug;

use crate::resources::BroadcastTarget;

/// Turns store changes into scoped per-consumer updates.
///
/// Subscriptions are read from snapshots handed in by the caller; this type
/// only remembers what each consumer was last sent and which thunk-caused
/// updates are still unacknowledged.
pub struct Broadcaster {
    last_state: State,
    last_sent: HashMap<ConsumerId, State>,
    tracker: UpdateTracker,
    max_depth: usize,
}

/// What one change produced.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub update_id: Option<UpdateId>,
    pub recipients: Vec<ConsumerId>,
}

impl Broadcaster {
    pub fn new(initial: State, max_depth: usize) -> Self {
        Self {
            last_state: initial,
            last_sent: HashMap::new(),
            tracker: UpdateTracker::new(),
            max_depth,
        }
    }

    /// The depth-limited slice of `state` visible through `subs`.
    pub fn visible(&self, subs: &SubscriptionManager, state: &State) -> State {
        serialize_with_depth(&subs.project(state), self.max_depth)
    }

    /// Push `state` to every target whose subscriptions intersect the change
    /// and whose visible slice actually differs from the last one sent.
    pub fn on_change(
        &mut self,
        state: &State,
        thunk: Option<ThunkId>,
        targets: &[BroadcastTarget],
    ) -> BroadcastReport {
        let changed = changed_paths(&self.last_state, state);
        self.last_state = state.clone();
        if changed.is_empty() {
            return BroadcastReport::default();
        }

        let update_id = UpdateId::generate();
        let mut recipients = Vec::new();
        for target in targets {
            if !target.subscriptions.touches(&changed) {
                continue;
            }
            let slice = self.visible(&target.subscriptions, state);
            if self.last_sent.get(&target.consumer) == Some(&slice) {
                continue;
            }
            let message = ServerMessage::StateUpdate(StateUpdate {
                update_id: update_id.clone(),
                state: slice.clone(),
                thunk_id: thunk.clone(),
            });
            if target.sender.send(message).is_ok() {
                self.last_sent.insert(target.consumer, slice);
                recipients.push(target.consumer);
            }
        }

        if recipients.is_empty() {
            return BroadcastReport::default();
        }
        debug!(
            update_id = %update_id,
            recipients = recipients.len(),
            thunk = ?thunk.as_ref().map(ThunkId::as_str),
            "state update broadcast"
        );
        if let Some(thunk) = thunk {
            self.tracker
                .track(update_id.clone(), thunk, recipients.iter().copied());
        }
        BroadcastReport {
            update_id: Some(update_id),
            recipients,
        }
    }

    /// Send the current slice right after a subscribe. Never attributed to a
    /// thunk and never tracked.
    pub fn initial(
        &mut self,
        consumer: ConsumerId,
        subs: &SubscriptionManager,
        state: &State,
        sender: &ServerSender,
    ) -> bool {
        let slice = self.visible(subs, state);
        let message = ServerMessage::StateUpdate(StateUpdate {
            update_id: UpdateId::generate(),
            state: slice.clone(),
            thunk_id: None,
        });
        if sender.send(message).is_err() {
            return false;
        }
        self.last_sent.insert(consumer, slice);
        true
    }

    pub fn acknowledge(&mut self, update: &UpdateId, consumer: ConsumerId) -> bool {
        self.tracker.acknowledge(update, consumer)
    }

    pub fn pending_for_thunk(&self, thunk: &ThunkId) -> usize {
        self.tracker.pending_for_thunk(thunk)
    }

    /// Drop everything held for a departed consumer.
    pub fn forget(&mut self, consumer: ConsumerId) {
        self.last_sent.remove(&consumer);
        let dropped = self.tracker.forget_consumer(consumer);
        if dropped > 0 {
            debug!(consumer = %consumer, dropped, "dropped unacknowledged updates");
        }
    }

    pub fn clear(&mut self) {
        self.last_sent.clear();
        self.tracker = UpdateTracker::new();
    }
}
