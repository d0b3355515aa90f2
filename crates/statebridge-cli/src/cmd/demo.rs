use crate::output::{print_json, print_table};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use statebridge_client::{BridgeClient, ClientConfig, Settlement, ThunkOptions};
use statebridge_core::{Action, BridgeConfig, BridgeError, MemoryStore, StateUpdate};
use statebridge_server::Bridge;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

const THUNK_ID: &str = "double-double-halve";
const INITIAL_COUNTER: i64 = 2;
const UPDATE_WAIT: Duration = Duration::from_secs(5);

/// One state push seen by the observing consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observed {
    pub counter: i64,
    pub thunk_id: Option<String>,
}

impl From<&StateUpdate> for Observed {
    fn from(update: &StateUpdate) -> Self {
        Self {
            counter: counter_of(&update.state),
            thunk_id: update.thunk_id.as_ref().map(|id| id.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub sequence: Vec<Observed>,
    pub bypass_ms: f64,
    pub thunk_ms: f64,
}

impl DemoReport {
    pub fn counters(&self) -> Vec<i64> {
        self.sequence.iter().map(|o| o.counter).collect()
    }
}

pub fn run(config: BridgeConfig, step_delay: Duration, json: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(replay(config, step_delay))?;

    if json {
        return print_json(&report);
    }

    let rows = report
        .sequence
        .iter()
        .enumerate()
        .map(|(i, o)| {
            vec![
                i.to_string(),
                o.counter.to_string(),
                o.thunk_id.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(&["STEP", "COUNTER", "THUNK"], rows);
    println!();
    println!(
        "bypass increment acknowledged in {:.1}ms; thunk finished in {:.1}ms",
        report.bypass_ms, report.thunk_ms
    );
    Ok(())
}

/// Consumer A runs double→double→halve as one locked thunk. Once the counter
/// reaches 4, consumer B sends a lock-bypassing increment. A third consumer
/// records every broadcast.
pub async fn replay(config: BridgeConfig, step_delay: Duration) -> Result<DemoReport> {
    let client_config = ClientConfig::from_bridge_config(&config);
    let bridge = Bridge::new(Arc::new(MemoryStore::counter(INITIAL_COUNTER)), config);

    let observer = BridgeClient::connect(bridge.connect()?, client_config.clone());
    let mut updates = observer.updates();
    observer.subscribe(None)?;
    let mut sequence = vec![Observed::from(&next_update(&mut updates).await?)];

    let a = subscribed(&bridge, &client_config).await?;
    let b = subscribed(&bridge, &client_config).await?;

    let reached_four = Arc::new(Notify::new());
    let resume = Arc::new(Notify::new());
    let thunk = tokio::spawn({
        let reached_four = reached_four.clone();
        let resume = resume.clone();
        async move {
            let started = Instant::now();
            a.thunk(ThunkOptions::new().with_id(THUNK_ID), |ctx| async move {
                let n = counter_of(&ctx.get_state());
                ctx.dispatch("counter:set", Some(json!(n * 2))).await?;
                reached_four.notify_one();
                resume.notified().await;
                tokio::time::sleep(step_delay).await;

                let n = counter_of(&ctx.get_state());
                ctx.dispatch("counter:set", Some(json!(n * 2))).await?;
                tokio::time::sleep(step_delay).await;

                let n = counter_of(&ctx.get_state());
                ctx.dispatch("counter:set", Some(json!(n / 2))).await?;
                Ok::<_, BridgeError>(())
            })
            .await?;
            Ok::<_, BridgeError>(started.elapsed())
        }
    });

    reached_four.notified().await;
    let started = Instant::now();
    let bypass = b
        .dispatch(Action::new("counter:increment").bypassing_lock())
        .await?;
    let bypass_elapsed = started.elapsed();
    resume.notify_one();
    if bypass.settlement != Settlement::Acknowledged {
        bail!("bypass increment settled as {:?}", bypass.settlement);
    }

    let thunk_elapsed = thunk.await.context("thunk task panicked")??;
    for _ in 0..4 {
        sequence.push(Observed::from(&next_update(&mut updates).await?));
    }
    bridge.destroy();

    Ok(DemoReport {
        sequence,
        bypass_ms: bypass_elapsed.as_secs_f64() * 1000.0,
        thunk_ms: thunk_elapsed.as_secs_f64() * 1000.0,
    })
}

async fn subscribed(bridge: &Arc<Bridge>, config: &ClientConfig) -> Result<BridgeClient> {
    let client = BridgeClient::connect(bridge.connect()?, config.clone());
    client.subscribe(None)?;
    client.fetch_state().await?;
    Ok(client)
}

async fn next_update(updates: &mut BroadcastStream<StateUpdate>) -> Result<StateUpdate> {
    let next = tokio::time::timeout(UPDATE_WAIT, updates.next())
        .await
        .context("no state update within 5s")?;
    match next {
        Some(Ok(update)) => Ok(update),
        Some(Err(e)) => Err(anyhow!("update stream lagged: {e}")),
        None => bail!("update stream closed"),
    }
}

fn counter_of(state: &Value) -> i64 {
    state["counter"].as_i64().unwrap_or_default()
}
