use statebridge_core::protocol::{ClientMessage, RequestId, ServerMessage, StateUpdate};
use statebridge_core::transport::{ClientSender, ConsumerLink};
use statebridge_core::{
    Action, ActionId, ActiveOperationsSummary, BridgeError, ConsumerId, Result, State,
    ThunkId, ThunkSnapshot, WireError,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::pending::{PendingTable, Wait};

// ─── Replies ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct DispatchReply {
    state: Option<State>,
    error: Option<WireError>,
    thunk: Option<ThunkSnapshot>,
}

#[derive(Debug)]
pub(crate) struct RegistrationReply {
    pub(crate) success: bool,
    pub(crate) error: Option<WireError>,
}

#[derive(Debug)]
enum QueryReply {
    Subscriptions(Vec<String>),
    Operations(ActiveOperationsSummary),
    State(State),
}

/// How a dispatch was settled on the sender side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The applier acknowledged the action.
    Acknowledged,
    /// No acknowledgment before the safety timeout; the action may or may not
    /// have been applied.
    TimedOut,
    /// The channel closed before an acknowledgment arrived.
    ChannelLost,
}

/// Result of [`BridgeClient::dispatch`].
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The action as it was sent.
    pub action: Action,
    /// Post-action state visible to this consumer, if it is subscribed.
    pub state: Option<State>,
    /// Snapshot of the owning thunk after the action ran.
    pub thunk: Option<ThunkSnapshot>,
    pub settlement: Settlement,
}

impl Dispatched {
    pub fn is_acknowledged(&self) -> bool {
        self.settlement == Settlement::Acknowledged
    }
}

// ─── BridgeClient ─────────────────────────────────────────────────────────

struct Inner {
    consumer: ConsumerId,
    tx: ClientSender,
    config: ClientConfig,
    dispatches: PendingTable<ActionId, DispatchReply>,
    registrations: PendingTable<ThunkId, RegistrationReply>,
    queries: PendingTable<RequestId, QueryReply>,
    next_request: AtomicU64,
    mirror: Mutex<State>,
    updates: broadcast::Sender<StateUpdate>,
    closed: AtomicBool,
}

/// Consumer-side handle on a bridge channel.
///
/// Cheap to clone. A background task reads the channel: it resolves pending
/// requests, applies and acknowledges every [`StateUpdate`], and releases all
/// pending requests once the channel closes.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// Take over `link` and start its reader task. Must be called inside a
    /// tokio runtime.
    pub fn connect(link: ConsumerLink, config: ClientConfig) -> Self {
        let ConsumerLink { consumer, tx, rx } = link;
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        let inner = Arc::new(Inner {
            consumer,
            tx,
            config,
            dispatches: PendingTable::new(),
            registrations: PendingTable::new(),
            queries: PendingTable::new(),
            next_request: AtomicU64::new(1),
            mirror: Mutex::new(State::Object(Default::default())),
            updates,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(read_channel(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.inner.consumer
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.tx.is_closed()
    }

    /// Dispatches still waiting for an acknowledgment.
    pub fn pending_dispatches(&self) -> usize {
        self.inner.dispatches.len()
    }

    pub(crate) fn send(&self, message: ClientMessage) -> Result<()> {
        self.inner
            .tx
            .send(message)
            .map_err(|_| BridgeError::ChannelLost(self.inner.consumer))
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Send `action` and wait for its acknowledgment.
    ///
    /// Store failures and access denials are errors. A missing
    /// acknowledgment is not: after the safety timeout the dispatch settles
    /// as [`Settlement::TimedOut`] so the caller is never stuck.
    pub async fn dispatch(&self, action: Action) -> Result<Dispatched> {
        let entry = self.inner.dispatches.register(action.id.clone());
        let sent = self.send(ClientMessage::Dispatch {
            action: action.clone(),
            parent_thunk_id: action.parent_thunk_id.clone(),
        });
        if sent.is_err() || self.inner.closed.load(Ordering::SeqCst) {
            return Ok(self.settle(action, Settlement::ChannelLost));
        }

        match entry.wait(self.inner.config.dispatch_timeout).await {
            Wait::Reply(reply) => {
                if let Some(error) = reply.error {
                    return Err(BridgeError::from_wire(error, self.inner.consumer));
                }
                Ok(Dispatched {
                    action,
                    state: reply.state,
                    thunk: reply.thunk,
                    settlement: Settlement::Acknowledged,
                })
            }
            Wait::TimedOut => {
                let err = BridgeError::LockTimeout(action.id.clone());
                warn!(
                    consumer = %self.inner.consumer,
                    action_type = %action.action_type,
                    timeout_ms = self.inner.config.dispatch_timeout.as_millis() as u64,
                    error = %err,
                    "releasing unacknowledged dispatch"
                );
                Ok(self.settle(action, Settlement::TimedOut))
            }
            Wait::Closed => Ok(self.settle(action, Settlement::ChannelLost)),
        }
    }

    fn settle(&self, action: Action, settlement: Settlement) -> Dispatched {
        if settlement == Settlement::ChannelLost {
            debug!(consumer = %self.inner.consumer, action_id = %action.id, "dispatch settled by channel loss");
        }
        Dispatched {
            action,
            state: None,
            thunk: None,
            settlement,
        }
    }

    // ---------------------------------------------------------------------
    // Thunk registration
    // ---------------------------------------------------------------------

    /// Send a registration and wait for its ack. `Ok(None)` means the ack did
    /// not arrive in time.
    pub(crate) async fn register_thunk(
        &self,
        message: ClientMessage,
        thunk_id: &ThunkId,
    ) -> Result<Option<RegistrationReply>> {
        let entry = self.inner.registrations.register(thunk_id.clone());
        self.send(message)?;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ChannelLost(self.inner.consumer));
        }
        match entry.wait(self.inner.config.registration_timeout).await {
            Wait::Reply(reply) => Ok(Some(reply)),
            Wait::TimedOut => Ok(None),
            Wait::Closed => Err(BridgeError::ChannelLost(self.inner.consumer)),
        }
    }

    // ---------------------------------------------------------------------
    // Subscriptions and queries
    // ---------------------------------------------------------------------

    /// Subscribe to `keys` (`None` = all state). The applier answers with an
    /// initial update carrying the visible slice.
    pub fn subscribe(&self, keys: Option<Vec<String>>) -> Result<()> {
        self.send(ClientMessage::Subscribe { keys })
    }

    pub fn unsubscribe(&self, keys: Option<Vec<String>>) -> Result<()> {
        self.send(ClientMessage::Unsubscribe { keys })
    }

    async fn query(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<QueryReply> {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::SeqCst);
        let entry = self.inner.queries.register(request_id);
        self.send(build(request_id))?;
        match entry.wait(self.inner.config.query_timeout).await {
            Wait::Reply(reply) => Ok(reply),
            Wait::TimedOut => Err(BridgeError::ActionCancelled(format!(
                "query {request_id} timed out"
            ))),
            Wait::Closed => Err(BridgeError::ChannelLost(self.inner.consumer)),
        }
    }

    /// Keys `consumer` is subscribed to, as the applier sees them.
    pub async fn subscriptions(&self, consumer: ConsumerId) -> Result<Vec<String>> {
        match self
            .query(|request_id| ClientMessage::GetSubscriptions {
                request_id,
                consumer_id: consumer,
            })
            .await?
        {
            QueryReply::Subscriptions(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    pub async fn active_operations(&self) -> Result<ActiveOperationsSummary> {
        match self
            .query(|request_id| ClientMessage::GetActiveOperations { request_id })
            .await?
        {
            QueryReply::Operations(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the applier for the current visible state and refresh the mirror
    /// with it.
    pub async fn fetch_state(&self) -> Result<State> {
        match self
            .query(|request_id| ClientMessage::GetState { request_id })
            .await?
        {
            QueryReply::State(state) => {
                *self.inner.mirror() = state.clone();
                Ok(state)
            }
            other => Err(unexpected(other)),
        }
    }

    // ---------------------------------------------------------------------
    // Mirror
    // ---------------------------------------------------------------------

    /// The last state slice received from the applier.
    pub fn state(&self) -> State {
        self.inner.mirror().clone()
    }

    /// Every update received from now on. Lagging readers skip ahead.
    pub fn updates(&self) -> BroadcastStream<StateUpdate> {
        BroadcastStream::new(self.inner.updates.subscribe())
    }
}

fn unexpected(reply: QueryReply) -> BridgeError {
    BridgeError::ActionCancelled(format!("mismatched reply: {reply:?}"))
}

impl Inner {
    fn mirror(&self) -> MutexGuard<'_, State> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, message: ServerMessage) {
        match message {
            ServerMessage::DispatchAck {
                action_id,
                state,
                error,
                thunk,
            } => {
                let reply = DispatchReply { state, error, thunk };
                if !self.dispatches.resolve(&action_id, reply) {
                    debug!(action_id = %action_id, "acknowledgment for a dispatch no longer pending");
                }
            }
            ServerMessage::RegisterThunkAck {
                thunk_id,
                success,
                error,
            } => {
                self.registrations
                    .resolve(&thunk_id, RegistrationReply { success, error });
            }
            ServerMessage::StateUpdate(update) => {
                *self.mirror() = update.state.clone();
                let update_id = update.update_id.clone();
                let _ = self.updates.send(update);
                let _ = self.tx.send(ClientMessage::AckUpdate { update_id });
            }
            ServerMessage::Subscriptions { request_id, keys } => {
                self.queries
                    .resolve(&request_id, QueryReply::Subscriptions(keys));
            }
            ServerMessage::ActiveOperations {
                request_id,
                summary,
            } => {
                self.queries
                    .resolve(&request_id, QueryReply::Operations(summary));
            }
            ServerMessage::State { request_id, state } => {
                self.queries.resolve(&request_id, QueryReply::State(state));
            }
        }
    }

    /// Release every pending request once the channel is gone.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = self.dispatches.drain() + self.registrations.drain() + self.queries.drain();
        info!(consumer = %self.consumer, released, "bridge channel closed");
    }
}

async fn read_channel(inner: Weak<Inner>, mut rx: UnboundedReceiver<ServerMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle(message);
    }
    if let Some(inner) = inner.upgrade() {
        inner.close();
    }
}
