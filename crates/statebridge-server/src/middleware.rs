use serde_json::Value;
use statebridge_core::{Action, ActionId, ConsumerId, LoggingConfig, State, ThunkId};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Per-action metadata handed to every middleware hook.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub consumer: ConsumerId,
    pub thunk_id: Option<ThunkId>,
    pub action_id: ActionId,
    pub received_at: Instant,
}

impl MiddlewareContext {
    pub fn for_action(action: &Action, consumer: ConsumerId) -> Self {
        Self {
            consumer,
            thunk_id: action.parent_thunk_id.clone(),
            action_id: action.id.clone(),
            received_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.received_at.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hooks around action application and consumer lifecycle.
///
/// Errors are logged by the bridge and never abort an action, a broadcast or
/// a teardown. Returning `Ok(None)` from `before_action` vetoes the action.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn before_action(
        &self,
        action: Action,
        _ctx: &MiddlewareContext,
    ) -> anyhow::Result<Option<Action>> {
        Ok(Some(action))
    }

    fn after_action(
        &self,
        _action: &Action,
        _state: &State,
        _ctx: &MiddlewareContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_consumer_connected(&self, _consumer: ConsumerId) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_consumer_disconnected(&self, _consumer: ConsumerId) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered middleware chain. `before_action` runs in insertion order,
/// `after_action` in reverse.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

/// Outcome of the `before_action` chain.
pub enum Admission {
    Proceed(Action),
    Vetoed { by: String },
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn before_action(&self, mut action: Action, ctx: &MiddlewareContext) -> Admission {
        for stage in &self.stages {
            match stage.before_action(action.clone(), ctx) {
                Ok(Some(next)) => action = next,
                Ok(None) => {
                    return Admission::Vetoed {
                        by: stage.name().to_string(),
                    }
                }
                Err(e) => warn!(
                    middleware = stage.name(),
                    action_id = %ctx.action_id,
                    error = %e,
                    "before_action failed; continuing"
                ),
            }
        }
        Admission::Proceed(action)
    }

    pub fn after_action(&self, action: &Action, state: &State, ctx: &MiddlewareContext) {
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.after_action(action, state, ctx) {
                warn!(
                    middleware = stage.name(),
                    action_id = %ctx.action_id,
                    error = %e,
                    "after_action failed"
                );
            }
        }
    }

    pub fn consumer_connected(&self, consumer: ConsumerId) {
        for stage in &self.stages {
            if let Err(e) = stage.on_consumer_connected(consumer) {
                warn!(middleware = stage.name(), consumer = %consumer, error = %e, "on_consumer_connected failed");
            }
        }
    }

    pub fn consumer_disconnected(&self, consumer: ConsumerId) {
        for stage in &self.stages {
            if let Err(e) = stage.on_consumer_disconnected(consumer) {
                warn!(middleware = stage.name(), consumer = %consumer, error = %e, "on_consumer_disconnected failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingMiddleware
// ---------------------------------------------------------------------------

/// Logs every action before and after it is applied, with processing time.
pub struct LoggingMiddleware {
    config: LoggingConfig,
}

impl LoggingMiddleware {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn before_action(
        &self,
        action: Action,
        ctx: &MiddlewareContext,
    ) -> anyhow::Result<Option<Action>> {
        if self.config.enabled {
            let payload = if self.config.include_payload {
                action.payload.clone().unwrap_or(Value::Null).to_string()
            } else {
                String::new()
            };
            info!(
                action_id = %action.id,
                action_type = %action.action_type,
                consumer = %ctx.consumer,
                thunk = ?ctx.thunk_id.as_ref().map(ThunkId::as_str),
                starts_thunk = action.starts_thunk,
                payload = %payload,
                "action received"
            );
        }
        Ok(Some(action))
    }

    fn after_action(
        &self,
        action: &Action,
        state: &State,
        ctx: &MiddlewareContext,
    ) -> anyhow::Result<()> {
        if self.config.enabled {
            let state = if self.config.include_state {
                state.to_string()
            } else {
                String::new()
            };
            info!(
                action_id = %action.id,
                action_type = %action.action_type,
                elapsed_ms = ctx.elapsed_ms(),
                state = %state,
                "action applied"
            );
        }
        Ok(())
    }

    fn on_consumer_connected(&self, consumer: ConsumerId) -> anyhow::Result<()> {
        if self.config.enabled {
            info!(consumer = %consumer, "consumer connected");
        }
        Ok(())
    }

    fn on_consumer_disconnected(&self, consumer: ConsumerId) -> anyhow::Result<()> {
        if self.config.enabled {
            info!(consumer = %consumer, "consumer disconnected");
        }
        Ok(())
    }
}
