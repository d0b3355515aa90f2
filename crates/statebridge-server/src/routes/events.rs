use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use statebridge_core::transport::ClientSender;
use statebridge_core::ConsumerId;
use std::convert::Infallible;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;

use crate::error::AppError;
use crate::state::AppState;

/// Releases the consumer when its event stream is dropped, unless a newer
/// stream has taken over the id.
struct ConnectionGuard {
    app: AppState,
    consumer: ConsumerId,
    tx: ClientSender,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let removed = {
            let mut links = self.app.links();
            match links.get(&self.consumer) {
                Some(current) if current.same_channel(&self.tx) => {
                    links.remove(&self.consumer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.app.bridge.disconnect(self.consumer);
        }
    }
}

/// GET /api/consumers/{id}/events: opens the consumer's channel and streams
/// every `ServerMessage` as a `message` event with a JSON body.
pub async fn consumer_events(
    State(app): State<AppState>,
    Path(id): Path<u32>,
) -> Result<impl IntoResponse, AppError> {
    let consumer = ConsumerId(id);
    if consumer.is_main() {
        return Err(AppError::bad_request("consumer id 0 is reserved"));
    }
    let link = app.bridge.connect_as(consumer)?;
    app.links().insert(consumer, link.tx.clone());

    let guard = ConnectionGuard {
        app: app.clone(),
        consumer,
        tx: link.tx,
    };
    let stream = UnboundedReceiverStream::new(link.rx).filter_map(move |message| {
        let _ = &guard;
        let data = serde_json::to_string(&message).ok()?;
        Some(Ok::<Event, Infallible>(
            Event::default().event("message").data(data),
        ))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
