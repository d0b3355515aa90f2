//! Client behaviour against a scripted applier that speaks the wire
//! protocol over JSON, the way an out-of-process applier would.

use serde_json::json;
use statebridge_client::{BridgeClient, ClientConfig, Settlement};
use statebridge_core::protocol::{ClientMessage, ServerMessage, StateUpdate};
use statebridge_core::{link, Action, ActiveOperationsSummary, BridgeEndpoint, ConsumerId};
use std::time::Duration;

/// Forward every message through a JSON round trip before answering.
fn spawn_applier(mut endpoint: BridgeEndpoint) {
    tokio::spawn(async move {
        while let Some(message) = endpoint.rx.recv().await {
            let wire = serde_json::to_string(&message).unwrap();
            let message: ClientMessage = serde_json::from_str(&wire).unwrap();
            let reply = match message {
                ClientMessage::Subscribe { .. } => Some(ServerMessage::StateUpdate(StateUpdate {
                    update_id: "initial".into(),
                    state: json!({ "counter": 2 }),
                    thunk_id: None,
                })),
                ClientMessage::GetState { request_id } => Some(ServerMessage::State {
                    request_id,
                    state: json!({ "counter": 2 }),
                }),
                ClientMessage::GetActiveOperations { request_id } => {
                    Some(ServerMessage::ActiveOperations {
                        request_id,
                        summary: ActiveOperationsSummary {
                            version: 3,
                            thunks: Vec::new(),
                        },
                    })
                }
                ClientMessage::Dispatch { action, .. } if action.action_type == "counter:slow" => {
                    None
                }
                ClientMessage::Dispatch { action, .. } => Some(ServerMessage::DispatchAck {
                    action_id: action.id,
                    state: Some(json!({ "counter": 3 })),
                    error: None,
                    thunk: None,
                }),
                _ => None,
            };
            if let Some(reply) = reply {
                let wire = serde_json::to_string(&reply).unwrap();
                let _ = endpoint.tx.send(serde_json::from_str(&wire).unwrap());
            }
        }
    });
}

fn connect(config: ClientConfig) -> BridgeClient {
    let (consumer, endpoint) = link(ConsumerId(5));
    spawn_applier(endpoint);
    BridgeClient::connect(consumer, config)
}

#[tokio::test]
async fn subscribe_seeds_the_mirror() {
    let client = connect(ClientConfig::default());
    client.subscribe(None).unwrap();

    assert_eq!(client.fetch_state().await.unwrap(), json!({ "counter": 2 }));
    assert_eq!(client.state(), json!({ "counter": 2 }));
}

#[tokio::test]
async fn active_operations_round_trip() {
    let client = connect(ClientConfig::default());
    let summary = client.active_operations().await.unwrap();
    assert_eq!(summary.version, 3);
    assert!(summary.thunks.is_empty());
}

#[tokio::test]
async fn slow_applier_does_not_block_other_dispatches() {
    let config = ClientConfig::default().with_dispatch_timeout(Duration::from_millis(200));
    let client = connect(config);

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.dispatch(Action::new("counter:slow")).await }
    });
    let fast = client.dispatch(Action::new("counter:increment")).await.unwrap();
    assert_eq!(fast.settlement, Settlement::Acknowledged);
    assert_eq!(fast.state, Some(json!({ "counter": 3 })));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.settlement, Settlement::TimedOut);
    assert_eq!(client.pending_dispatches(), 0);
}
