use serde_json::Value;
use statebridge_core::protocol::ClientMessage;
use statebridge_core::{Action, BridgeError, Result, State, ThunkId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::client::{BridgeClient, Settlement};

/// How a thunk is registered with the applier.
#[derive(Debug, Clone, Default)]
pub struct ThunkOptions {
    /// Generated when `None`.
    pub id: Option<ThunkId>,
    pub bypass_lock: bool,
    pub bypass_access_control: bool,
}

impl ThunkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<ThunkId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn bypassing_lock(mut self) -> Self {
        self.bypass_lock = true;
        self
    }

    pub fn bypassing_access_control(mut self) -> Self {
        self.bypass_access_control = true;
        self
    }
}

// ─── CompletionGuard ──────────────────────────────────────────────────────

/// Reports the thunk's completion exactly once, including when the body is
/// cancelled or panics.
struct CompletionGuard {
    client: BridgeClient,
    id: ThunkId,
    sent: bool,
}

impl CompletionGuard {
    fn complete(&mut self, error: Option<String>) {
        if std::mem::replace(&mut self.sent, true) {
            return;
        }
        let message = ClientMessage::CompleteThunk {
            thunk_id: self.id.clone(),
            error,
        };
        if self.client.send(message).is_err() {
            debug!(thunk = %self.id, "channel closed before thunk completion was reported");
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.complete(Some("thunk abandoned before it finished".into()));
    }
}

// ─── ThunkContext ─────────────────────────────────────────────────────────

/// Handle a thunk body uses to act on the bridge.
///
/// `get_state` reads the thunk's own view: the state seen when the
/// outermost thunk started, replaced by the acknowledged result of each
/// dispatch made through this context or a nested one. Mutations by other
/// consumers are not folded in; use `latest_state` for the mirror.
#[derive(Clone)]
pub struct ThunkContext {
    client: BridgeClient,
    id: ThunkId,
    view: Arc<Mutex<State>>,
    started: Arc<AtomicBool>,
}

impl ThunkContext {
    pub fn id(&self) -> &ThunkId {
        &self.id
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    fn view(&self) -> MutexGuard<'_, State> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_state(&self) -> State {
        self.view().clone()
    }

    /// The client's mirror, including other consumers' changes.
    pub fn latest_state(&self) -> State {
        self.client.state()
    }

    pub async fn dispatch(
        &self,
        action_type: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<State> {
        let mut action = Action::new(action_type);
        if let Some(payload) = payload {
            action = action.with_payload(payload);
        }
        self.dispatch_action(action).await
    }

    /// Dispatch `action` as part of this thunk and return the updated view.
    ///
    /// A timed-out dispatch leaves the view unchanged; a lost channel is an
    /// error since the thunk cannot continue.
    pub async fn dispatch_action(&self, action: Action) -> Result<State> {
        let mut action = action.in_thunk(self.id.clone());
        action.starts_thunk = !self.started.swap(true, Ordering::SeqCst);

        let dispatched = self.client.dispatch(action).await?;
        match dispatched.settlement {
            Settlement::Acknowledged => {
                if let Some(state) = dispatched.state {
                    *self.view() = state;
                }
                Ok(self.get_state())
            }
            Settlement::TimedOut => Ok(self.get_state()),
            Settlement::ChannelLost => Err(BridgeError::ChannelLost(self.client.consumer_id())),
        }
    }

    /// Run `body` as a child thunk sharing this thunk's view.
    pub async fn thunk<F, Fut, T>(&self, options: ThunkOptions, body: F) -> Result<T>
    where
        F: FnOnce(ThunkContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        run_thunk(
            &self.client,
            options,
            Some(self.id.clone()),
            self.view.clone(),
            body,
        )
        .await
    }
}

impl BridgeClient {
    /// Run `body` as a root thunk.
    ///
    /// The thunk is registered before the body runs and its completion is
    /// reported exactly once afterwards. The body's error is returned as-is
    /// and marks the thunk failed on the applier.
    pub async fn thunk<F, Fut, T>(&self, options: ThunkOptions, body: F) -> Result<T>
    where
        F: FnOnce(ThunkContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let view = Arc::new(Mutex::new(self.state()));
        run_thunk(self, options, None, view, body).await
    }
}

async fn run_thunk<F, Fut, T>(
    client: &BridgeClient,
    options: ThunkOptions,
    parent: Option<ThunkId>,
    view: Arc<Mutex<State>>,
    body: F,
) -> Result<T>
where
    F: FnOnce(ThunkContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let id = options.id.unwrap_or_else(ThunkId::generate);
    let message = ClientMessage::RegisterThunk {
        thunk_id: id.clone(),
        parent_id: parent.clone(),
        bypass_lock: options.bypass_lock,
        bypass_access_control: options.bypass_access_control,
    };

    match client.register_thunk(message, &id).await? {
        Some(reply) if !reply.success => {
            let err = match reply.error {
                Some(error) => BridgeError::from_wire(error, client.consumer_id()),
                None => BridgeError::InvalidParent(parent.unwrap_or_else(|| id.clone())),
            };
            return Err(err);
        }
        Some(_) => {}
        None => warn!(
            thunk = %id,
            consumer = %client.consumer_id(),
            "thunk registration not acknowledged in time; proceeding"
        ),
    }

    let mut guard = CompletionGuard {
        client: client.clone(),
        id: id.clone(),
        sent: false,
    };
    let ctx = ThunkContext {
        client: client.clone(),
        id,
        view,
        started: Arc::new(AtomicBool::new(false)),
    };

    let result = body(ctx).await;
    guard.complete(result.as_ref().err().map(ToString::to_string));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;
    use statebridge_core::protocol::ServerMessage;
    use statebridge_core::{link, BridgeEndpoint, ConsumerId};

    fn client() -> (BridgeClient, BridgeEndpoint) {
        let (consumer, endpoint) = link(ConsumerId(1));
        (BridgeClient::connect(consumer, ClientConfig::default()), endpoint)
    }

    /// Acknowledges registrations and answers each dispatch with `counter`
    /// set to the payload.
    fn spawn_applier(mut endpoint: BridgeEndpoint) -> tokio::task::JoinHandle<Vec<ClientMessage>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = endpoint.rx.recv().await {
                match &message {
                    ClientMessage::RegisterThunk { thunk_id, .. } => {
                        let _ = endpoint.tx.send(ServerMessage::RegisterThunkAck {
                            thunk_id: thunk_id.clone(),
                            success: true,
                            error: None,
                        });
                    }
                    ClientMessage::Dispatch { action, .. } => {
                        let _ = endpoint.tx.send(ServerMessage::DispatchAck {
                            action_id: action.id.clone(),
                            state: Some(json!({ "counter": action.payload.clone() })),
                            error: None,
                            thunk: None,
                        });
                    }
                    _ => {}
                }
                let done = matches!(message, ClientMessage::CompleteThunk { .. });
                seen.push(message);
                if done {
                    break;
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn thunk_registers_runs_and_completes_once() {
        let (client, endpoint) = client();
        let applier = spawn_applier(endpoint);

        let value = client
            .thunk(ThunkOptions::new().with_id("t1"), |ctx| async move {
                let state = ctx.dispatch("counter:set", Some(json!(3))).await?;
                assert_eq!(state, json!({ "counter": 3 }));
                assert_eq!(ctx.get_state(), json!({ "counter": 3 }));
                Ok::<_, BridgeError>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let seen = applier.await.unwrap();
        assert!(matches!(&seen[0], ClientMessage::RegisterThunk { thunk_id, .. } if thunk_id.as_str() == "t1"));
        let ClientMessage::Dispatch { action, .. } = &seen[1] else {
            panic!("expected dispatch");
        };
        assert_eq!(action.parent_thunk_id, Some(ThunkId::from("t1")));
        assert!(action.starts_thunk);
        assert_eq!(
            seen[2],
            ClientMessage::CompleteThunk {
                thunk_id: "t1".into(),
                error: None
            }
        );
    }

    #[tokio::test]
    async fn body_error_is_returned_and_reported() {
        let (client, endpoint) = client();
        let applier = spawn_applier(endpoint);

        let err = client
            .thunk(ThunkOptions::new().with_id("t2"), |_ctx| async move {
                Err::<(), _>(BridgeError::ApplyActionFailed("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ApplyActionFailed(_)));

        let seen = applier.await.unwrap();
        let Some(ClientMessage::CompleteThunk { error: Some(error), .. }) = seen.last() else {
            panic!("expected a failed completion");
        };
        assert!(error.contains("nope"));
    }

    #[tokio::test]
    async fn cancelled_body_still_reports_completion() {
        let (client, endpoint) = client();
        let applier = spawn_applier(endpoint);

        let run = client.thunk(ThunkOptions::new().with_id("t3"), |_ctx| async move {
            std::future::pending::<Result<()>>().await
        });
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), run).await;

        let seen = applier.await.unwrap();
        let completions = seen
            .iter()
            .filter(|m| matches!(m, ClientMessage::CompleteThunk { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn rejected_registration_skips_the_body() {
        let (client, mut endpoint) = client();
        tokio::spawn(async move {
            if let Some(ClientMessage::RegisterThunk { thunk_id, .. }) = endpoint.rx.recv().await {
                let err = BridgeError::InvalidParent("missing".into());
                let _ = endpoint.tx.send(ServerMessage::RegisterThunkAck {
                    thunk_id,
                    success: false,
                    error: Some(err.to_wire()),
                });
            }
            // Keep the channel open until the client is done.
            while endpoint.rx.recv().await.is_some() {}
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let err = client
            .thunk(ThunkOptions::new(), |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BridgeError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParent(_)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn nested_thunk_shares_the_view() {
        let (client, endpoint) = client();
        // The applier stops at the first completion, which is the child's.
        let applier = spawn_applier(endpoint);

        let outer = client.thunk(ThunkOptions::new().with_id("outer"), |ctx| async move {
            ctx.thunk(ThunkOptions::new().with_id("inner"), |inner| async move {
                inner.dispatch("counter:set", Some(json!(9))).await
            })
            .await?;
            Ok::<_, BridgeError>(ctx.get_state())
        });
        let state = outer.await.unwrap();
        assert_eq!(state, json!({ "counter": 9 }));

        let seen = applier.await.unwrap();
        assert!(matches!(
            &seen[1],
            ClientMessage::RegisterThunk { parent_id: Some(p), .. } if p.as_str() == "outer"
        ));
    }
}
