//! In-memory, ordered, reliable point-to-point channel between one consumer
//! and the applier.
//!
//! Each [`link`] call yields both ends. Dropping the consumer end's sender is
//! the destroy notification: the applier's receiver then yields `None`.

use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::ConsumerId;

pub type ClientSender = mpsc::UnboundedSender<ClientMessage>;
pub type ServerSender = mpsc::UnboundedSender<ServerMessage>;

/// Consumer side: sends [`ClientMessage`]s, receives [`ServerMessage`]s.
#[derive(Debug)]
pub struct ConsumerLink {
    pub consumer: ConsumerId,
    pub tx: ClientSender,
    pub rx: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Applier side of the same channel.
#[derive(Debug)]
pub struct BridgeEndpoint {
    pub consumer: ConsumerId,
    pub tx: ServerSender,
    pub rx: mpsc::UnboundedReceiver<ClientMessage>,
}

pub fn link(consumer: ConsumerId) -> (ConsumerLink, BridgeEndpoint) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    (
        ConsumerLink {
            consumer,
            tx: client_tx,
            rx: server_rx,
        },
        BridgeEndpoint {
            consumer,
            tx: server_tx,
            rx: client_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_flow_both_ways_in_order() {
        let (mut consumer, mut bridge) = link(ConsumerId(7));
        assert_eq!(bridge.consumer, ConsumerId(7));

        consumer
            .tx
            .send(ClientMessage::Subscribe { keys: None })
            .unwrap();
        consumer
            .tx
            .send(ClientMessage::GetState { request_id: 1 })
            .unwrap();
        assert_eq!(
            bridge.rx.recv().await,
            Some(ClientMessage::Subscribe { keys: None })
        );
        assert_eq!(
            bridge.rx.recv().await,
            Some(ClientMessage::GetState { request_id: 1 })
        );

        bridge
            .tx
            .send(ServerMessage::Subscriptions {
                request_id: 2,
                keys: vec!["*".into()],
            })
            .unwrap();
        assert!(matches!(
            consumer.rx.recv().await,
            Some(ServerMessage::Subscriptions { request_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn dropping_consumer_closes_bridge_side() {
        let (consumer, mut bridge) = link(ConsumerId(1));
        drop(consumer);
        assert_eq!(bridge.rx.recv().await, None);
        assert!(bridge.tx.is_closed());
    }
}
