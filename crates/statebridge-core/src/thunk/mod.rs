//! Thunk tree bookkeeping and the root lock that serializes independent trees.

pub mod lock;
pub mod registry;

pub use lock::{LockScope, RootLock};
pub use registry::{
    ActiveOperationsSummary, Thunk, ThunkEvent, ThunkRegistry, ThunkSnapshot, ThunkSpec,
    ThunkState,
};
