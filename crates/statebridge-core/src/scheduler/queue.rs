use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::types::{Action, ConsumerId};

pub type TaskId = u64;

/// Priority of actions that bypass the root lock.
pub const BYPASS_PRIORITY: i32 = 100;
/// Priority of actions issued from inside a thunk.
pub const THUNK_PRIORITY: i32 = 50;
/// Priority of standalone actions.
pub const DEFAULT_PRIORITY: i32 = 0;

// ---------------------------------------------------------------------------
// ActionTask
// ---------------------------------------------------------------------------

/// Unit of scheduling: one action plus the policy used to admit it.
#[derive(Debug, Clone)]
pub struct ActionTask {
    pub id: TaskId,
    pub action: Action,
    pub consumer: ConsumerId,
    pub priority: i32,
    pub can_run_concurrently: bool,
    pub created_at: Instant,
}

impl ActionTask {
    /// Build a task with the default policy: bypassing actions run first and
    /// may race, thunk actions come next, standalone actions last.
    pub fn new(action: Action, consumer: ConsumerId) -> Self {
        let priority = if action.bypass_lock {
            BYPASS_PRIORITY
        } else if action.parent_thunk_id.is_some() {
            THUNK_PRIORITY
        } else {
            DEFAULT_PRIORITY
        };
        let can_run_concurrently = action.bypass_lock;
        Self {
            id: 0,
            action,
            consumer,
            priority,
            can_run_concurrently,
            created_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the task safe to run alongside other work.
    pub fn concurrent(mut self) -> Self {
        self.can_run_concurrently = true;
        self
    }

    /// Exclusive tasks occupy the single serial execution slot.
    pub fn is_exclusive(&self) -> bool {
        !self.can_run_concurrently && !self.action.bypass_lock
    }
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

type QueueKey = (Reverse<i32>, u64);

/// Waiting tasks ordered by priority (higher first), then arrival.
///
/// `R` is whatever the caller needs to hand back once the task runs,
/// typically a response channel.
pub struct TaskQueue<R> {
    entries: BTreeMap<QueueKey, (ActionTask, R)>,
    next_seq: u64,
}

impl<R> Default for TaskQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TaskQueue<R> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, task: ActionTask, responder: R) {
        let key = (Reverse(task.priority), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, (task, responder));
    }

    /// Remove and return the highest-ranked task satisfying `eligible`.
    pub fn pop_first_where(
        &mut self,
        mut eligible: impl FnMut(&ActionTask) -> bool,
    ) -> Option<(ActionTask, R)> {
        let key = *self
            .entries
            .iter()
            .find(|(_, (task, _))| eligible(task))
            .map(|(key, _)| key)?;
        self.entries.remove(&key)
    }

    /// Remove every task matching `pred`, preserving queue order.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&ActionTask) -> bool) -> Vec<(ActionTask, R)> {
        let keys: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, (task, _))| pred(task))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn highest_priority(&self) -> Option<i32> {
        self.entries.keys().next().map(|(Reverse(p), _)| *p)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &ActionTask> {
        self.entries.values().map(|(task, _)| task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThunkId;

    fn task(kind: &str, priority: i32) -> ActionTask {
        ActionTask::new(Action::new(kind), ConsumerId(1)).with_priority(priority)
    }

    #[test]
    fn default_policy_ranks_bypass_then_thunk_then_plain() {
        let bypass = ActionTask::new(Action::new("a").bypassing_lock(), ConsumerId(1));
        let thunked = ActionTask::new(Action::new("b").in_thunk(ThunkId::from("t")), ConsumerId(1));
        let plain = ActionTask::new(Action::new("c"), ConsumerId(1));

        assert_eq!(bypass.priority, BYPASS_PRIORITY);
        assert!(bypass.can_run_concurrently);
        assert!(!bypass.is_exclusive());
        assert_eq!(thunked.priority, THUNK_PRIORITY);
        assert!(thunked.is_exclusive());
        assert_eq!(plain.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn pops_by_priority_then_arrival() {
        let mut queue = TaskQueue::new();
        queue.push(task("low-1", 0), ());
        queue.push(task("high", 10), ());
        queue.push(task("low-2", 0), ());
        queue.push(task("mid", 5), ());

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_first_where(|_| true))
            .map(|(t, _)| t.action.action_type)
            .collect();
        assert_eq!(order, vec!["high", "mid", "low-1", "low-2"]);
    }

    #[test]
    fn pop_skips_ineligible_tasks() {
        let mut queue = TaskQueue::new();
        queue.push(task("blocked", 10), ());
        queue.push(task("ready", 0), ());

        let (t, _) = queue
            .pop_first_where(|t| t.action.action_type != "blocked")
            .unwrap();
        assert_eq!(t.action.action_type, "ready");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.highest_priority(), Some(10));
    }

    #[test]
    fn remove_where_returns_matches_in_order() {
        let mut queue = TaskQueue::new();
        queue.push(task("x:1", 0), 1);
        queue.push(task("y", 0), 2);
        queue.push(task("x:2", 3), 3);

        let removed: Vec<i32> = queue
            .remove_where(|t| t.action.action_type.starts_with('x'))
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        assert_eq!(removed, vec![3, 1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn empty_queue_has_no_highest_priority() {
        let queue: TaskQueue<()> = TaskQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.highest_priority(), None);
    }
}
