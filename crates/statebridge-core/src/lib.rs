pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod thunk;
pub mod tracking;
pub mod transport;
pub mod types;

pub use config::{BridgeConfig, ConfigWarning, LoggingConfig, WarnLevel};
pub use error::{BridgeError, ErrorKind, Result, WireError};
pub use protocol::{ClientMessage, RequestId, ServerMessage, StateUpdate};
pub use scheduler::{ActionTask, QueueStatus, Scheduler, TaskExecutor, TaskHandle};
pub use store::{counter_reducer, MemoryStore, StateStore, StoreSubscription};
pub use subscription::SubscriptionManager;
pub use thunk::{ActiveOperationsSummary, ThunkEvent, ThunkSnapshot, ThunkSpec, ThunkState};
pub use tracking::UpdateTracker;
pub use transport::{link, BridgeEndpoint, ConsumerLink};
pub use types::{Action, ActionId, ConsumerId, State, ThunkId, UpdateId};
