//! `statebridge-client`: consumer side of the state bridge.
//!
//! # Architecture
//!
//! ```text
//! BridgeClient::dispatch / thunk
//!     │  registers a waiter, sends ClientMessage
//!     ▼
//! PendingTable   ← action id / thunk id / request id → oneshot
//!     ▲              entries removed on reply, timeout, cancel or close
//!     │
//! reader task    ← resolves acks, applies + acknowledges StateUpdates,
//!                   drains every table when the channel closes
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use statebridge_client::{BridgeClient, ClientConfig, ThunkOptions};
//! use serde_json::json;
//!
//! let client = BridgeClient::connect(bridge.connect()?, ClientConfig::default());
//! client.subscribe(None)?;
//!
//! client
//!     .thunk(ThunkOptions::new(), |ctx| async move {
//!         let n = ctx.get_state()["counter"].as_i64().unwrap_or(0);
//!         ctx.dispatch("counter:set", Some(json!(n * 2))).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod pending;
pub mod thunk;

pub use client::{BridgeClient, Dispatched, Settlement};
pub use config::ClientConfig;
pub use pending::{PendingEntry, PendingTable, Wait};
pub use thunk::{ThunkContext, ThunkOptions};
