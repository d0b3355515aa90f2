//! Priority scheduler layered over the root lock.
//!
//! Every mutation of the thunk registry, the lock holder and the wait queue
//! goes through one mutex inside [`Scheduler`], so callers from any task see
//! a single writer. Admitted tasks run on spawned tokio tasks through a
//! [`TaskExecutor`]; whenever one finishes, or a thunk settles, the queue is
//! drained again.

pub mod queue;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::thunk::{
    ActiveOperationsSummary, LockScope, RootLock, ThunkEvent, ThunkRegistry, ThunkSnapshot,
    ThunkSpec,
};
use crate::types::{ConsumerId, State, ThunkId};

pub use queue::{ActionTask, TaskId, TaskQueue, BYPASS_PRIORITY, DEFAULT_PRIORITY, THUNK_PRIORITY};

// ─── Executor seam ────────────────────────────────────────────────────────

/// Applies an admitted task. Implemented by the bridge over its state store.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, task: &ActionTask) -> BoxFuture<'static, Result<State>>;
}

type Responder = oneshot::Sender<Result<State>>;

// ─── TaskHandle ───────────────────────────────────────────────────────────

/// Resolves with the outcome of an enqueued task.
///
/// If the task is purged before it runs (see [`Scheduler::remove_tasks`]) the
/// handle resolves to [`BridgeError::ActionCancelled`] instead of hanging.
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<State>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<State>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| {
                Err(BridgeError::ActionCancelled(
                    "task discarded before it ran".into(),
                ))
            })
        })
    }
}

// ─── QueueStatus ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub is_idle: bool,
    pub queued_count: usize,
    pub running_count: usize,
    pub highest_priority_queued: Option<i32>,
    pub lock_holder: Option<ThunkId>,
}

// ─── Inner state ──────────────────────────────────────────────────────────

struct RunningTask {
    exclusive: bool,
}

struct Inner {
    registry: ThunkRegistry,
    lock: RootLock,
    queue: TaskQueue<Responder>,
    running: HashMap<TaskId, RunningTask>,
    next_task_id: TaskId,
}

impl Inner {
    fn exclusive_running(&self) -> bool {
        self.running.values().any(|r| r.exclusive)
    }

    fn is_eligible(&self, task: &ActionTask) -> bool {
        let lock_ok = self.lock.can_process_action(&task.action, &self.registry)
            || (task.can_run_concurrently
                && LockScope::of(&task.action, &self.registry) == LockScope::Standalone);
        if !lock_ok {
            return false;
        }
        !task.is_exclusive() || !self.exclusive_running()
    }

    fn admit(&mut self, task: &ActionTask) {
        self.lock.try_acquire_root_lock(&task.action, &self.registry);
        if let Some(owner) = &task.action.parent_thunk_id {
            self.registry.mark_executing(owner);
        }
        self.running.insert(
            task.id,
            RunningTask {
                exclusive: task.is_exclusive(),
            },
        );
    }

    /// Release the lock and drop the tree once everything under `id`'s root
    /// is terminal.
    fn settle(&mut self, id: &ThunkId) {
        let root = self.registry.root_of(id);
        self.lock.release_root_lock_if_complete(id, &self.registry);
        if let Some(root) = root {
            let held = self.lock.holder() == Some(&root);
            if !held && self.registry.is_tree_complete(&root) {
                self.registry.evict_tree(&root);
            }
        }
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            is_idle: self.queue.is_empty() && self.running.is_empty(),
            queued_count: self.queue.len(),
            running_count: self.running.len(),
            highest_priority_queued: self.queue.highest_priority(),
            lock_holder: self.lock.holder().cloned(),
        }
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────

struct Shared {
    inner: Mutex<Inner>,
    executor: Arc<dyn TaskExecutor>,
}

/// Decides, per action, whether it runs now or waits; drains automatically.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    registry: ThunkRegistry::new(),
                    lock: RootLock::new(),
                    queue: TaskQueue::new(),
                    running: HashMap::new(),
                    next_task_id: 1,
                }),
                executor,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Run the task now if it is admissible, otherwise queue it.
    pub fn enqueue(&self, mut task: ActionTask) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner();
        task.id = inner.next_task_id;
        inner.next_task_id += 1;
        let id = task.id;

        if inner.is_eligible(&task) {
            inner.admit(&task);
            drop(inner);
            self.spawn(task, tx);
        } else {
            debug!(
                task = id,
                action_id = %task.action.id,
                action_type = %task.action.action_type,
                priority = task.priority,
                "task queued"
            );
            inner.queue.push(task, tx);
        }

        TaskHandle { id, rx }
    }

    /// Admit every queued task that has become eligible, highest priority
    /// first.
    pub fn process_queue(&self) {
        let admitted = {
            let mut inner = self.inner();
            let mut admitted = Vec::new();
            loop {
                // The eligibility check reads the rest of `Inner`, so the
                // queue is detached while it is searched.
                let mut queue = std::mem::take(&mut inner.queue);
                let next = queue.pop_first_where(|t| inner.is_eligible(t));
                inner.queue = queue;
                let Some((task, tx)) = next else {
                    break;
                };
                inner.admit(&task);
                admitted.push((task, tx));
            }
            admitted
        };

        for (task, tx) in admitted {
            debug!(task = task.id, action_id = %task.action.id, "queued task admitted");
            self.spawn(task, tx);
        }
    }

    fn spawn(&self, task: ActionTask, tx: Responder) {
        let fut = self.shared.executor.execute(&task);
        let slot = RunningSlot {
            scheduler: Some(self.clone()),
            task: task.id,
        };
        tokio::spawn(async move {
            let mut slot = slot;
            let result = fut.await;
            slot.release();
            let _ = tx.send(result);
        });
    }

    fn finish(&self, task: TaskId) {
        self.inner().running.remove(&task);
        self.process_queue();
    }

    /// Purge queued work belonging to `thunk_id` or any of its descendants.
    /// Returns how many tasks were dropped; their handles resolve as cancelled.
    pub fn remove_tasks(&self, thunk_id: &ThunkId) -> usize {
        let mut inner = self.inner();
        let removed = remove_thunk_tasks(&mut inner, thunk_id);
        if removed > 0 {
            debug!(thunk = %thunk_id, removed, "purged queued tasks of abandoned thunk");
        }
        removed
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.inner().status()
    }

    // ---------------------------------------------------------------------
    // Thunks
    // ---------------------------------------------------------------------

    pub fn register_thunk(&self, spec: ThunkSpec) -> Result<ThunkId> {
        self.inner().registry.register(spec)
    }

    pub fn complete_thunk(&self, id: &ThunkId) -> bool {
        let changed = {
            let mut inner = self.inner();
            let changed = inner.registry.mark_completed(id);
            if changed {
                inner.settle(id);
            }
            changed
        };
        if changed {
            self.process_queue();
        } else {
            debug!(thunk = %id, "completion for unknown or finished thunk ignored");
        }
        changed
    }

    pub fn fail_thunk(&self, id: &ThunkId, error: &str) -> bool {
        let changed = {
            let mut inner = self.inner();
            let changed = inner.registry.mark_failed(id, error);
            if changed {
                remove_thunk_tasks(&mut inner, id);
                inner.settle(id);
            }
            changed
        };
        if changed {
            self.process_queue();
        }
        changed
    }

    /// Fail every live thunk of a vanished consumer and drop its queued work.
    /// Returns the number of thunks failed.
    pub fn abandon_consumer(&self, consumer: ConsumerId) -> usize {
        let failed = {
            let mut inner = self.inner();
            let dropped = inner.queue.remove_where(|t| t.consumer == consumer).len();
            let ids = inner.registry.active_thunks_of(consumer);
            for id in &ids {
                inner.registry.mark_failed(id, "consumer disconnected");
            }
            for id in &ids {
                inner.settle(id);
            }
            if dropped > 0 || !ids.is_empty() {
                warn!(
                    consumer = %consumer,
                    thunks = ids.len(),
                    tasks = dropped,
                    "abandoned work of disconnected consumer"
                );
            }
            ids.len()
        };
        self.process_queue();
        failed
    }

    pub fn is_tree_complete(&self, id: &ThunkId) -> bool {
        self.inner().registry.is_tree_complete(id)
    }

    pub fn thunk(&self, id: &ThunkId) -> Option<ThunkSnapshot> {
        self.inner().registry.snapshot(id)
    }

    pub fn bypasses_access_control(&self, id: &ThunkId) -> bool {
        self.inner().registry.bypasses_access_control(id)
    }

    pub fn summary(&self) -> ActiveOperationsSummary {
        self.inner().registry.summary()
    }

    pub fn thunk_events(&self) -> broadcast::Receiver<ThunkEvent> {
        self.inner().registry.events()
    }
}

fn remove_thunk_tasks(inner: &mut Inner, thunk_id: &ThunkId) -> usize {
    let registry = &inner.registry;
    inner
        .queue
        .remove_where(|t| {
            t.action
                .parent_thunk_id
                .as_ref()
                .is_some_and(|owner| registry.is_within(owner, thunk_id))
        })
        .len()
}

// ─── RunningSlot ──────────────────────────────────────────────────────────

/// Frees the running slot even if the executor future panics.
struct RunningSlot {
    scheduler: Option<Scheduler>,
    task: TaskId,
}

impl RunningSlot {
    fn release(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.finish(self.task);
        }
    }
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.release();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
