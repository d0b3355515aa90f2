use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ActionId, ConsumerId, ThunkId};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid parent thunk: {0}")]
    InvalidParent(ThunkId),

    #[error("thunk not found: {0}")]
    ThunkNotFound(ThunkId),

    #[error("no acknowledgment for action {0} before the safety timeout")]
    LockTimeout(ActionId),

    #[error("store rejected action: {0}")]
    ApplyActionFailed(String),

    #[error("consumer {consumer} has no access to state key '{key}'")]
    AccessDenied { consumer: ConsumerId, key: String },

    #[error("channel to consumer {0} lost")]
    ChannelLost(ConsumerId),

    #[error("action cancelled: {0}")]
    ActionCancelled(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

/// Error classification carried across the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParent,
    ThunkNotFound,
    LockTimeout,
    ApplyActionFailed,
    AccessDenied,
    ChannelLost,
    ActionCancelled,
    Internal,
}

/// Serializable form of a [`BridgeError`] as sent in acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidParent(_) => ErrorKind::InvalidParent,
            BridgeError::ThunkNotFound(_) => ErrorKind::ThunkNotFound,
            BridgeError::LockTimeout(_) => ErrorKind::LockTimeout,
            BridgeError::ApplyActionFailed(_) => ErrorKind::ApplyActionFailed,
            BridgeError::AccessDenied { .. } => ErrorKind::AccessDenied,
            BridgeError::ChannelLost(_) => ErrorKind::ChannelLost,
            BridgeError::ActionCancelled(_) => ErrorKind::ActionCancelled,
            BridgeError::Config(_)
            | BridgeError::Io(_)
            | BridgeError::Json(_)
            | BridgeError::Yaml(_) => ErrorKind::Internal,
        }
    }

    pub fn to_wire(&self) -> WireError {
        let (message, key) = match self {
            BridgeError::InvalidParent(id) | BridgeError::ThunkNotFound(id) => {
                (id.to_string(), None)
            }
            BridgeError::LockTimeout(id) => (id.to_string(), None),
            BridgeError::ApplyActionFailed(msg) | BridgeError::ActionCancelled(msg) => {
                (msg.clone(), None)
            }
            BridgeError::AccessDenied { key, .. } => (self.to_string(), Some(key.clone())),
            other => (other.to_string(), None),
        };
        WireError {
            kind: self.kind(),
            message,
            key,
        }
    }

    /// Rebuild an error received from the other side of the channel.
    ///
    /// `consumer` is the local consumer id; it stands in for ids the wire
    /// format does not carry.
    pub fn from_wire(err: WireError, consumer: ConsumerId) -> Self {
        match err.kind {
            ErrorKind::InvalidParent => BridgeError::InvalidParent(ThunkId::from(err.message)),
            ErrorKind::ThunkNotFound => BridgeError::ThunkNotFound(ThunkId::from(err.message)),
            ErrorKind::LockTimeout => BridgeError::LockTimeout(ActionId::from(err.message)),
            ErrorKind::ApplyActionFailed => BridgeError::ApplyActionFailed(err.message),
            ErrorKind::AccessDenied => BridgeError::AccessDenied {
                consumer,
                key: err.key.unwrap_or_default(),
            },
            ErrorKind::ChannelLost => BridgeError::ChannelLost(consumer),
            ErrorKind::ActionCancelled => BridgeError::ActionCancelled(err.message),
            ErrorKind::Internal => BridgeError::ApplyActionFailed(err.message),
        }
    }
}
