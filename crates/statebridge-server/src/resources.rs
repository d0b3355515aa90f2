use chrono::{DateTime, Utc};
use statebridge_core::transport::ServerSender;
use statebridge_core::{ConsumerId, SubscriptionManager};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::task::AbortHandle;
use tracing::{info, warn};

pub type TeardownHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Bookkeeping kept for one consumer.
pub struct ConsumerRecord {
    /// `None` until the first subscribe; dropped again once emptied.
    subscriptions: Option<SubscriptionManager>,
    sender: Option<ServerSender>,
    listener: Option<AbortHandle>,
    created_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl ConsumerRecord {
    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }
}

impl Drop for ConsumerRecord {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// A consumer that currently receives broadcasts.
#[derive(Clone)]
pub struct BroadcastTarget {
    pub consumer: ConsumerId,
    pub subscriptions: SubscriptionManager,
    pub sender: ServerSender,
}

/// Owns every per-consumer resource: subscriptions, the outgoing channel and
/// the disconnect listener task.
///
/// Memory is bounded by `max_tracked`: admitting a consumer beyond the limit
/// evicts the oldest-created record first.
pub struct ResourceManager {
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    max_tracked: usize,
    next_seq: u64,
    hooks: Vec<TeardownHook>,
    destroyed: bool,
}

impl ResourceManager {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            consumers: HashMap::new(),
            max_tracked,
            next_seq: 0,
            hooks: Vec::new(),
            destroyed: false,
        }
    }

    /// Start tracking `consumer` (or refresh its channel). Returns the
    /// consumers evicted to make room.
    pub fn track(&mut self, consumer: ConsumerId, sender: Option<ServerSender>) -> Vec<ConsumerId> {
        if let Some(record) = self.consumers.get_mut(&consumer) {
            if sender.is_some() {
                record.sender = sender;
            }
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while !self.consumers.is_empty() && self.consumers.len() >= self.max_tracked {
            let Some(oldest) = self
                .consumers
                .iter()
                .min_by_key(|(_, r)| r.created_seq)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.consumers.remove(&oldest);
            info!(consumer = %oldest, limit = self.max_tracked, "evicted oldest tracked consumer");
            evicted.push(oldest);
        }

        self.consumers.insert(
            consumer,
            ConsumerRecord {
                subscriptions: None,
                sender,
                listener: None,
                created_seq: self.next_seq,
                created_at: Utc::now(),
            },
        );
        self.next_seq += 1;
        evicted
    }

    /// Record the task watching this consumer's channel. A previous listener
    /// is aborted. Returns `false` if the consumer is not tracked, in which
    /// case the new listener is aborted as well.
    pub fn install_listener(&mut self, consumer: ConsumerId, listener: AbortHandle) -> bool {
        match self.consumers.get_mut(&consumer) {
            Some(record) => {
                if let Some(previous) = record.listener.replace(listener) {
                    previous.abort();
                }
                true
            }
            None => {
                listener.abort();
                false
            }
        }
    }

    pub fn subscribe(&mut self, consumer: ConsumerId, keys: Option<&[String]>) -> Vec<ConsumerId> {
        let evicted = self.track(consumer, None);
        if let Some(record) = self.consumers.get_mut(&consumer) {
            let subs = record
                .subscriptions
                .get_or_insert_with(SubscriptionManager::new);
            subs.subscribe(keys);
            if subs.is_empty() {
                record.subscriptions = None;
            }
        }
        evicted
    }

    pub fn unsubscribe(&mut self, consumer: ConsumerId, keys: Option<&[String]>) {
        let Some(record) = self.consumers.get_mut(&consumer) else {
            return;
        };
        if let Some(subs) = record.subscriptions.as_mut() {
            subs.unsubscribe(keys);
            if subs.is_empty() {
                record.subscriptions = None;
            }
        }
    }

    pub fn subscription(&self, consumer: ConsumerId) -> Option<&SubscriptionManager> {
        self.consumers
            .get(&consumer)
            .and_then(|r| r.subscriptions.as_ref())
    }

    pub fn subscriptions(&self, consumer: ConsumerId) -> Vec<String> {
        self.subscription(consumer)
            .map(SubscriptionManager::keys)
            .unwrap_or_default()
    }

    pub fn has_access(&self, consumer: ConsumerId, key: &str) -> bool {
        self.subscription(consumer)
            .is_some_and(|subs| subs.has_access(key))
    }

    pub fn sender(&self, consumer: ConsumerId) -> Option<ServerSender> {
        self.consumers
            .get(&consumer)
            .and_then(|r| r.sender.clone())
    }

    pub fn record(&self, consumer: ConsumerId) -> Option<&ConsumerRecord> {
        self.consumers.get(&consumer)
    }

    /// Consumers with both a subscription and an open channel.
    pub fn targets(&self) -> Vec<BroadcastTarget> {
        let mut targets: Vec<BroadcastTarget> = self
            .consumers
            .iter()
            .filter_map(|(id, r)| {
                Some(BroadcastTarget {
                    consumer: *id,
                    subscriptions: r.subscriptions.clone()?,
                    sender: r.sender.clone().filter(|s| !s.is_closed())?,
                })
            })
            .collect();
        targets.sort_by_key(|t| t.consumer);
        targets
    }

    pub fn remove(&mut self, consumer: ConsumerId) -> bool {
        self.consumers.remove(&consumer).is_some()
    }

    pub fn is_tracked(&self, consumer: ConsumerId) -> bool {
        self.consumers.contains_key(&consumer)
    }

    pub fn tracked(&self) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Consumers whose channel is still open.
    pub fn live(&self) -> HashSet<ConsumerId> {
        self.consumers
            .iter()
            .filter(|(_, r)| r.sender.as_ref().is_some_and(|s| !s.is_closed()))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop every tracked consumer missing from `active`. The applier's own
    /// bookkeeping is never swept.
    pub fn sweep(&mut self, active: &HashSet<ConsumerId>) -> Vec<ConsumerId> {
        let mut stale: Vec<ConsumerId> = self
            .consumers
            .keys()
            .filter(|id| !id.is_main() && !active.contains(id))
            .copied()
            .collect();
        stale.sort();
        for id in &stale {
            self.consumers.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "swept stale consumers");
        }
        stale
    }

    pub fn add_teardown_hook(&mut self, hook: TeardownHook) {
        self.hooks.push(hook);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Release everything and run the teardown hooks once. Hook errors and
    /// panics are logged. Returns the consumers that were still tracked.
    pub fn destroy(&mut self) -> Vec<ConsumerId> {
        if self.destroyed {
            return Vec::new();
        }
        self.destroyed = true;

        let ids = self.tracked();
        self.consumers.clear();

        for (i, hook) in self.hooks.drain(..).enumerate() {
            match catch_unwind(AssertUnwindSafe(hook)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(hook = i, error = %e, "teardown hook failed"),
                Err(_) => warn!(hook = i, "teardown hook panicked"),
            }
        }
        ids
    }
}
