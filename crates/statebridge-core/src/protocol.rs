use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::thunk::{ActiveOperationsSummary, ThunkSnapshot};
use crate::types::{Action, ActionId, ConsumerId, State, ThunkId, UpdateId};

/// Correlates a query with its reply.
pub type RequestId = u64;

// ─── Consumer → applier ───────────────────────────────────────────────────

/// Messages a consumer sends to the applier.
/// Discriminated by the JSON `"type"` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Dispatch {
        action: Action,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_thunk_id: Option<ThunkId>,
    },
    RegisterThunk {
        thunk_id: ThunkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<ThunkId>,
        #[serde(default)]
        bypass_lock: bool,
        #[serde(default)]
        bypass_access_control: bool,
    },
    /// Fire-and-forget. `error` set means the thunk body failed.
    CompleteThunk {
        thunk_id: ThunkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// `keys: None` subscribes to the whole state.
    Subscribe {
        #[serde(default)]
        keys: Option<Vec<String>>,
    },
    /// `keys: None` clears every subscription of the consumer.
    Unsubscribe {
        #[serde(default)]
        keys: Option<Vec<String>>,
    },
    AckUpdate {
        update_id: UpdateId,
    },
    GetSubscriptions {
        request_id: RequestId,
        consumer_id: ConsumerId,
    },
    GetActiveOperations {
        request_id: RequestId,
    },
    GetState {
        request_id: RequestId,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Dispatch { .. } => "dispatch",
            ClientMessage::RegisterThunk { .. } => "register_thunk",
            ClientMessage::CompleteThunk { .. } => "complete_thunk",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::AckUpdate { .. } => "ack_update",
            ClientMessage::GetSubscriptions { .. } => "get_subscriptions",
            ClientMessage::GetActiveOperations { .. } => "get_active_operations",
            ClientMessage::GetState { .. } => "get_state",
        }
    }
}

// ─── Applier → consumer ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of a `Dispatch`. `state` is the consumer's visible slice after
    /// the action applied; `thunk` describes the owning thunk, if any.
    DispatchAck {
        action_id: ActionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<State>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thunk: Option<ThunkSnapshot>,
    },
    RegisterThunkAck {
        thunk_id: ThunkId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    StateUpdate(StateUpdate),
    Subscriptions {
        request_id: RequestId,
        keys: Vec<String>,
    },
    ActiveOperations {
        request_id: RequestId,
        summary: ActiveOperationsSummary,
    },
    State {
        request_id: RequestId,
        state: State,
    },
}

/// A scoped state push. `thunk_id` names the thunk whose action caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub update_id: UpdateId,
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thunk_id: Option<ThunkId>,
}
