use anyhow::{Context, Result};
use statebridge_core::{BridgeConfig, MemoryStore};
use statebridge_server::Bridge;
use std::sync::Arc;

pub fn run(config: BridgeConfig, port: u16, initial_counter: i64) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;

        let bridge = Bridge::new(Arc::new(MemoryStore::counter(initial_counter)), config);
        tracing::info!(counter = initial_counter, "serving in-memory counter store");

        statebridge_server::serve_on(bridge, listener).await
    })
}
