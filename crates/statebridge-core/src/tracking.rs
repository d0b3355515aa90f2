use std::collections::{BTreeSet, HashMap};

use crate::types::{ConsumerId, ThunkId, UpdateId};

#[derive(Debug)]
struct TrackedUpdate {
    thunk: ThunkId,
    awaiting: BTreeSet<ConsumerId>,
}

/// Records which consumers still owe an acknowledgment for each update that
/// a thunk's action caused.
///
/// Untracked updates (initial sends, mutations outside any thunk) never
/// enter the tracker. Entries disappear once every recipient has
/// acknowledged or gone away.
#[derive(Debug, Default)]
pub struct UpdateTracker {
    updates: HashMap<UpdateId, TrackedUpdate>,
}

impl UpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(
        &mut self,
        update: UpdateId,
        thunk: ThunkId,
        recipients: impl IntoIterator<Item = ConsumerId>,
    ) {
        let awaiting: BTreeSet<ConsumerId> = recipients.into_iter().collect();
        if awaiting.is_empty() {
            return;
        }
        self.updates.insert(update, TrackedUpdate { thunk, awaiting });
    }

    /// Returns `true` if the acknowledgment was outstanding.
    pub fn acknowledge(&mut self, update: &UpdateId, consumer: ConsumerId) -> bool {
        let Some(entry) = self.updates.get_mut(update) else {
            return false;
        };
        let removed = entry.awaiting.remove(&consumer);
        if entry.awaiting.is_empty() {
            self.updates.remove(update);
        }
        removed
    }

    /// Drop every outstanding acknowledgment of a departed consumer. Its
    /// updates are not retried.
    pub fn forget_consumer(&mut self, consumer: ConsumerId) -> usize {
        let mut dropped = 0;
        self.updates.retain(|_, entry| {
            if entry.awaiting.remove(&consumer) {
                dropped += 1;
            }
            !entry.awaiting.is_empty()
        });
        dropped
    }

    /// Number of acknowledgments still owed for updates caused by `thunk`.
    pub fn pending_for_thunk(&self, thunk: &ThunkId) -> usize {
        self.updates
            .values()
            .filter(|entry| entry.thunk == *thunk)
            .map(|entry| entry.awaiting.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UpdateId {
        UpdateId::from(s)
    }

    #[test]
    fn acknowledgments_retire_entries() {
        let mut tracker = UpdateTracker::new();
        let thunk = ThunkId::from("t");
        tracker.track(uid("u1"), thunk.clone(), [ConsumerId(1), ConsumerId(2)]);
        assert_eq!(tracker.pending_for_thunk(&thunk), 2);

        assert!(tracker.acknowledge(&uid("u1"), ConsumerId(1)));
        assert!(!tracker.acknowledge(&uid("u1"), ConsumerId(1)));
        assert_eq!(tracker.pending_for_thunk(&thunk), 1);

        assert!(tracker.acknowledge(&uid("u1"), ConsumerId(2)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn departed_consumer_is_forgotten() {
        let mut tracker = UpdateTracker::new();
        let thunk = ThunkId::from("t");
        tracker.track(uid("u1"), thunk.clone(), [ConsumerId(1)]);
        tracker.track(uid("u2"), thunk.clone(), [ConsumerId(1), ConsumerId(2)]);

        assert_eq!(tracker.forget_consumer(ConsumerId(1)), 2);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.pending_for_thunk(&thunk), 1);
    }

    #[test]
    fn update_without_recipients_is_not_tracked() {
        let mut tracker = UpdateTracker::new();
        tracker.track(uid("u"), ThunkId::from("t"), []);
        assert!(tracker.is_empty());
        assert!(!tracker.acknowledge(&uid("u"), ConsumerId(1)));
    }
}
