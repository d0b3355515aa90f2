use futures::future::BoxFuture;
use statebridge_core::protocol::{ClientMessage, ServerMessage};
use statebridge_core::scheduler::{ActionTask, QueueStatus, Scheduler, TaskExecutor};
use statebridge_core::transport::{link, BridgeEndpoint, ConsumerLink, ServerSender};
use statebridge_core::{
    Action, ActiveOperationsSummary, BridgeConfig, BridgeError, ConsumerId, Result, State,
    StateStore, StoreSubscription, ThunkId, ThunkSpec, UpdateId,
};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::middleware::{Admission, LoggingMiddleware, Middleware, MiddlewareContext, Pipeline};
use crate::resources::{ResourceManager, TeardownHook};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The applier side of the bridge.
///
/// One `Bridge` owns the scheduler, the broadcast engine and the consumer
/// bookkeeping for one state store. Consumers reach it through
/// [`Bridge::connect`]; the applier process itself uses [`Bridge::dispatch`].
pub struct Bridge {
    store: Arc<dyn StateStore>,
    config: BridgeConfig,
    scheduler: Scheduler,
    pipeline: Pipeline,
    resources: Mutex<ResourceManager>,
    broadcaster: Mutex<Broadcaster>,
    /// Serializes store writes so each change is broadcast before the next.
    apply_lock: Mutex<()>,
    /// Thunk owning the action currently being applied.
    attribution: Mutex<Option<ThunkId>>,
    store_subscription: Mutex<Option<StoreSubscription>>,
    me: Weak<Bridge>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    next_consumer: AtomicU32,
    destroyed: AtomicBool,
}

/// Runs admitted tasks against the store on behalf of the scheduler.
struct StoreExecutor {
    bridge: Weak<Bridge>,
}

impl TaskExecutor for StoreExecutor {
    fn execute(&self, task: &ActionTask) -> BoxFuture<'static, Result<State>> {
        let bridge = self.bridge.clone();
        let action = task.action.clone();
        let consumer = task.consumer;
        Box::pin(async move {
            let bridge = bridge
                .upgrade()
                .ok_or_else(|| BridgeError::ActionCancelled("bridge destroyed".into()))?;
            bridge.apply(action, consumer)
        })
    }
}

impl Bridge {
    pub fn new(store: Arc<dyn StateStore>, config: BridgeConfig) -> Arc<Self> {
        Self::with_middleware(store, config, Vec::new())
    }

    /// Build a bridge with extra middleware. The logging middleware is
    /// prepended when `config.logging.enabled`.
    pub fn with_middleware(
        store: Arc<dyn StateStore>,
        config: BridgeConfig,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Arc<Self> {
        let mut pipeline = Pipeline::default();
        if config.logging.enabled {
            pipeline.push(Arc::new(LoggingMiddleware::new(config.logging.clone())));
        }
        for stage in middleware {
            pipeline.push(stage);
        }

        let initial = store.get_state();
        let bridge = Arc::new_cyclic(|weak: &Weak<Bridge>| Bridge {
            scheduler: Scheduler::new(Arc::new(StoreExecutor {
                bridge: weak.clone(),
            })),
            resources: Mutex::new(ResourceManager::new(config.max_tracked_consumers)),
            broadcaster: Mutex::new(Broadcaster::new(initial, config.max_serialization_depth)),
            apply_lock: Mutex::new(()),
            attribution: Mutex::new(None),
            store_subscription: Mutex::new(None),
            me: weak.clone(),
            sweep: Mutex::new(None),
            next_consumer: AtomicU32::new(1),
            destroyed: AtomicBool::new(false),
            pipeline,
            config,
            store,
        });

        let weak = Arc::downgrade(&bridge);
        let subscription = bridge.store.subscribe_to_changes(Box::new(move |state| {
            if let Some(bridge) = weak.upgrade() {
                bridge.on_store_change(state);
            }
        }));
        *lock(&bridge.store_subscription) = Some(subscription);
        bridge
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> State {
        self.store.get_state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------------

    /// Open a channel for a new consumer with a fresh id.
    pub fn connect(self: &Arc<Self>) -> Result<ConsumerLink> {
        let id = ConsumerId(self.next_consumer.fetch_add(1, Ordering::SeqCst));
        self.connect_as(id)
    }

    /// Open a channel for `consumer`, replacing any previous channel it had.
    pub fn connect_as(self: &Arc<Self>, consumer: ConsumerId) -> Result<ConsumerLink> {
        if self.is_destroyed() {
            return Err(BridgeError::ChannelLost(consumer));
        }
        if consumer.is_main() {
            return Err(BridgeError::Config(
                "consumer id 0 is reserved for the applier".into(),
            ));
        }
        // Keep generated ids clear of explicitly chosen ones.
        self.next_consumer
            .fetch_max(consumer.0.saturating_add(1), Ordering::SeqCst);

        let (consumer_link, endpoint) = link(consumer);
        let evicted = lock(&self.resources).track(consumer, Some(endpoint.tx.clone()));
        for id in evicted {
            self.release_consumer(id);
        }

        let listener = tokio::spawn(run_connection(Arc::downgrade(self), endpoint));
        let installed = lock(&self.resources).install_listener(consumer, listener.abort_handle());
        if installed {
            debug!(consumer = %consumer, "disconnect listener installed");
            self.pipeline.consumer_connected(consumer);
        }
        Ok(consumer_link)
    }

    /// Tear down everything held for `consumer`: subscriptions, queued work,
    /// live thunks and unacknowledged updates.
    pub fn disconnect(&self, consumer: ConsumerId) {
        let was_tracked = lock(&self.resources).remove(consumer);
        self.release_consumer(consumer);
        if was_tracked {
            info!(consumer = %consumer, "consumer channel closed");
        }
    }

    fn release_consumer(&self, consumer: ConsumerId) {
        self.scheduler.abandon_consumer(consumer);
        lock(&self.broadcaster).forget(consumer);
        self.pipeline.consumer_disconnected(consumer);
    }

    /// Consumers whose channel is still open.
    pub fn live_consumers(&self) -> HashSet<ConsumerId> {
        lock(&self.resources).live()
    }

    pub fn tracked_consumers(&self) -> Vec<ConsumerId> {
        lock(&self.resources).tracked()
    }

    /// Evict tracked consumers missing from `active`. Returns the evicted ids.
    pub fn sweep(&self, active: &HashSet<ConsumerId>) -> Vec<ConsumerId> {
        let stale = lock(&self.resources).sweep(active);
        for id in &stale {
            self.release_consumer(*id);
        }
        stale
    }

    /// Periodically sweep against the ids `provider` reports as active.
    /// Does nothing when the sweep interval is disabled.
    pub fn start_sweep<F>(self: &Arc<Self>, provider: F) -> bool
    where
        F: Fn() -> HashSet<ConsumerId> + Send + Sync + 'static,
    {
        let Some(interval) = self.config.sweep_interval() else {
            return false;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                let active = provider();
                bridge.sweep(&active);
            }
        });
        if let Some(previous) = lock(&self.sweep).replace(handle) {
            previous.abort();
        }
        true
    }

    pub fn add_teardown_hook(&self, hook: TeardownHook) {
        lock(&self.resources).add_teardown_hook(hook);
    }

    /// Release all tracked state and run teardown hooks. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweep) = lock(&self.sweep).take() {
            sweep.abort();
        }
        if let Some(subscription) = lock(&self.store_subscription).take() {
            subscription.unsubscribe();
        }
        let consumers = lock(&self.resources).destroy();
        for id in &consumers {
            self.scheduler.abandon_consumer(*id);
        }
        lock(&self.broadcaster).clear();
        info!(consumers = consumers.len(), "bridge destroyed");
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Add keys (`None` = everything) and push the consumer its current slice.
    pub fn subscribe(&self, consumer: ConsumerId, keys: Option<Vec<String>>) {
        let (evicted, subs, sender) = {
            let mut resources = lock(&self.resources);
            let evicted = resources.subscribe(consumer, keys.as_deref());
            (
                evicted,
                resources.subscription(consumer).cloned(),
                resources.sender(consumer),
            )
        };
        for id in evicted {
            self.release_consumer(id);
        }
        debug!(consumer = %consumer, keys = ?keys, "subscribed");

        if let (Some(subs), Some(sender)) = (subs, sender) {
            let state = self.store.get_state();
            lock(&self.broadcaster).initial(consumer, &subs, &state, &sender);
        }
    }

    /// Remove keys (`None` = all). An emptied subscription record is dropped.
    pub fn unsubscribe(&self, consumer: ConsumerId, keys: Option<Vec<String>>) {
        lock(&self.resources).unsubscribe(consumer, keys.as_deref());
        debug!(consumer = %consumer, keys = ?keys, "unsubscribed");
    }

    pub fn subscriptions(&self, consumer: ConsumerId) -> Vec<String> {
        lock(&self.resources).subscriptions(consumer)
    }

    /// The depth-limited slice `consumer` may see, or `None` without a
    /// subscription.
    pub fn visible_state(&self, consumer: ConsumerId, state: &State) -> Option<State> {
        let subs = lock(&self.resources).subscription(consumer).cloned()?;
        Some(lock(&self.broadcaster).visible(&subs, state))
    }

    pub fn acknowledge_update(&self, consumer: ConsumerId, update: &UpdateId) -> bool {
        lock(&self.broadcaster).acknowledge(update, consumer)
    }

    /// Acknowledgments still owed for updates caused by `thunk`.
    pub fn pending_acks(&self, thunk: &ThunkId) -> usize {
        lock(&self.broadcaster).pending_for_thunk(thunk)
    }

    fn on_store_change(&self, state: &State) {
        let thunk = lock(&self.attribution).clone();
        let targets = lock(&self.resources).targets();
        lock(&self.broadcaster).on_change(state, thunk, &targets);
    }

    // ---------------------------------------------------------------------
    // Actions and thunks
    // ---------------------------------------------------------------------

    /// Dispatch an action from the applier process itself. Never subject to
    /// access control.
    pub async fn dispatch(&self, action: Action) -> Result<State> {
        self.scheduler
            .enqueue(ActionTask::new(action, ConsumerId::MAIN))
            .await
    }

    pub fn register_thunk(&self, spec: ThunkSpec) -> Result<ThunkId> {
        self.scheduler.register_thunk(spec)
    }

    /// Settle a thunk as completed, or failed when `error` is given.
    /// `Ok(false)` means it had already settled.
    pub fn complete_thunk(&self, id: &ThunkId, error: Option<&str>) -> Result<bool> {
        if self.scheduler.thunk(id).is_none() {
            return Err(BridgeError::ThunkNotFound(id.clone()));
        }
        Ok(match error {
            Some(error) => self.scheduler.fail_thunk(id, error),
            None => self.scheduler.complete_thunk(id),
        })
    }

    pub fn summary(&self) -> ActiveOperationsSummary {
        self.scheduler.summary()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.queue_status()
    }

    /// Reject the action if the consumer may not touch its target key.
    fn check_access(&self, action: &Action, consumer: ConsumerId) -> Result<()> {
        if !self.config.enforce_access_control || consumer.is_main() || action.bypass_access_control
        {
            return Ok(());
        }
        if let Some(thunk) = &action.parent_thunk_id {
            if self.scheduler.bypasses_access_control(thunk) {
                return Ok(());
            }
        }
        let Some(key) = action.target_key() else {
            return Ok(());
        };
        if lock(&self.resources).has_access(consumer, key) {
            Ok(())
        } else {
            Err(BridgeError::AccessDenied {
                consumer,
                key: key.to_string(),
            })
        }
    }

    /// Apply one admitted action: middleware, store write, broadcast.
    fn apply(&self, action: Action, consumer: ConsumerId) -> Result<State> {
        let ctx = MiddlewareContext::for_action(&action, consumer);
        let action = match self.pipeline.before_action(action, &ctx) {
            Admission::Proceed(action) => action,
            Admission::Vetoed { by } => {
                debug!(action_id = %ctx.action_id, middleware = %by, "action vetoed");
                return Err(BridgeError::ActionCancelled(format!(
                    "vetoed by middleware '{by}'"
                )));
            }
        };

        let state = {
            let _guard = lock(&self.apply_lock);
            *lock(&self.attribution) = action.parent_thunk_id.clone();
            let result = catch_unwind(AssertUnwindSafe(|| self.store.apply_action(&action)));
            *lock(&self.attribution) = None;
            match result {
                Ok(result) => result?,
                Err(_) => {
                    warn!(action_id = %action.id, action_type = %action.action_type, "store panicked while applying action");
                    return Err(BridgeError::ApplyActionFailed(format!(
                        "store panicked while applying '{}'",
                        action.action_type
                    )));
                }
            }
        };

        self.pipeline.after_action(&action, &state, &ctx);
        Ok(state)
    }

    // ---------------------------------------------------------------------
    // Channel messages
    // ---------------------------------------------------------------------

    fn handle_message(&self, consumer: ConsumerId, tx: &ServerSender, message: ClientMessage) {
        debug!(consumer = %consumer, kind = message.kind(), "message received");
        match message {
            ClientMessage::Dispatch {
                mut action,
                parent_thunk_id,
            } => {
                if parent_thunk_id.is_some() {
                    action.parent_thunk_id = parent_thunk_id;
                }
                self.handle_dispatch(consumer, tx, action);
            }
            ClientMessage::RegisterThunk {
                thunk_id,
                parent_id,
                bypass_lock,
                bypass_access_control,
            } => {
                let spec = ThunkSpec {
                    id: thunk_id.clone(),
                    source: consumer,
                    parent_id,
                    bypass_lock,
                    bypass_access_control,
                };
                let ack = match self.scheduler.register_thunk(spec) {
                    Ok(_) => ServerMessage::RegisterThunkAck {
                        thunk_id,
                        success: true,
                        error: None,
                    },
                    Err(e) => {
                        warn!(consumer = %consumer, thunk = %thunk_id, error = %e, "thunk registration rejected");
                        ServerMessage::RegisterThunkAck {
                            thunk_id,
                            success: false,
                            error: Some(e.to_wire()),
                        }
                    }
                };
                let _ = tx.send(ack);
            }
            ClientMessage::CompleteThunk { thunk_id, error } => {
                match self.complete_thunk(&thunk_id, error.as_deref()) {
                    Ok(true) => {}
                    Ok(false) => debug!(thunk = %thunk_id, "completion for settled thunk ignored"),
                    Err(e) => debug!(consumer = %consumer, error = %e, "completion ignored"),
                }
            }
            ClientMessage::Subscribe { keys } => self.subscribe(consumer, keys),
            ClientMessage::Unsubscribe { keys } => self.unsubscribe(consumer, keys),
            ClientMessage::AckUpdate { update_id } => {
                self.acknowledge_update(consumer, &update_id);
            }
            ClientMessage::GetSubscriptions {
                request_id,
                consumer_id,
            } => {
                let _ = tx.send(ServerMessage::Subscriptions {
                    request_id,
                    keys: self.subscriptions(consumer_id),
                });
            }
            ClientMessage::GetActiveOperations { request_id } => {
                let _ = tx.send(ServerMessage::ActiveOperations {
                    request_id,
                    summary: self.summary(),
                });
            }
            ClientMessage::GetState { request_id } => {
                let state = self.store.get_state();
                let state = self
                    .visible_state(consumer, &state)
                    .unwrap_or_else(|| State::Object(Default::default()));
                let _ = tx.send(ServerMessage::State { request_id, state });
            }
        }
    }

    /// Admit or queue the action now, in arrival order; acknowledge once it
    /// settles without blocking the channel.
    fn handle_dispatch(&self, consumer: ConsumerId, tx: &ServerSender, action: Action) {
        let action_id = action.id.clone();
        let thunk = action.parent_thunk_id.clone();
        if let Some(thunk) = &thunk {
            if self.scheduler.thunk(thunk).is_none() {
                warn!(consumer = %consumer, thunk = %thunk, action_id = %action_id, "dispatch for unknown thunk; running standalone");
            }
        }

        if let Err(e) = self.check_access(&action, consumer) {
            warn!(consumer = %consumer, action_id = %action_id, error = %e, "dispatch rejected");
            let _ = tx.send(ServerMessage::DispatchAck {
                action_id,
                state: None,
                error: Some(e.to_wire()),
                thunk: None,
            });
            return;
        }

        let handle = self.scheduler.enqueue(ActionTask::new(action, consumer));
        let bridge = self.me.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = handle.await;
            let bridge = bridge.upgrade();
            let snapshot = bridge
                .as_ref()
                .zip(thunk.as_ref())
                .and_then(|(b, id)| b.scheduler.thunk(id));
            let ack = match result {
                Ok(state) => ServerMessage::DispatchAck {
                    action_id,
                    state: bridge.and_then(|b| b.visible_state(consumer, &state)),
                    error: None,
                    thunk: snapshot,
                },
                Err(e) => ServerMessage::DispatchAck {
                    action_id,
                    state: None,
                    error: Some(e.to_wire()),
                    thunk: snapshot,
                },
            };
            let _ = tx.send(ack);
        });
    }
}

/// Reads one consumer's channel until it closes, then releases the consumer.
async fn run_connection(bridge: Weak<Bridge>, mut endpoint: BridgeEndpoint) {
    let consumer = endpoint.consumer;
    while let Some(message) = endpoint.rx.recv().await {
        let Some(bridge) = bridge.upgrade() else {
            return;
        };
        bridge.handle_message(consumer, &endpoint.tx, message);
    }
    if let Some(bridge) = bridge.upgrade() {
        bridge.disconnect(consumer);
    }
}
