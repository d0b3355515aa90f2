use statebridge_core::transport::ClientSender;
use statebridge_core::ConsumerId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bridge::Bridge;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    /// Consumer-side senders of the channels opened by SSE streams.
    pub links: Arc<Mutex<HashMap<ConsumerId, ClientSender>>>,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        let state = Self {
            bridge,
            links: Arc::new(Mutex::new(HashMap::new())),
        };

        // Sweep consumers whose stream is gone. Skipped outside a runtime
        // (sync unit tests).
        if tokio::runtime::Handle::try_current().is_ok() {
            let links = state.links.clone();
            state
                .bridge
                .start_sweep(move || active_ids(&lock_links(&links)));
        }

        state
    }

    pub fn links(&self) -> MutexGuard<'_, HashMap<ConsumerId, ClientSender>> {
        lock_links(&self.links)
    }

    pub fn sender(&self, consumer: ConsumerId) -> Option<ClientSender> {
        self.links().get(&consumer).cloned()
    }
}

fn lock_links(
    links: &Mutex<HashMap<ConsumerId, ClientSender>>,
) -> MutexGuard<'_, HashMap<ConsumerId, ClientSender>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

fn active_ids(links: &HashMap<ConsumerId, ClientSender>) -> HashSet<ConsumerId> {
    links
        .iter()
        .filter(|(_, tx)| !tx.is_closed())
        .map(|(id, _)| *id)
        .collect()
}
