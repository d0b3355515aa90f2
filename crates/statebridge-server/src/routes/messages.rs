use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use statebridge_core::{BridgeError, ClientMessage, ConsumerId};

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/consumers/{id}/messages: forward one `ClientMessage` into the
/// consumer's open channel. Replies arrive on the event stream.
pub async fn post_message(
    State(app): State<AppState>,
    Path(id): Path<u32>,
    Json(message): Json<ClientMessage>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let consumer = ConsumerId(id);
    let tx = app
        .sender(consumer)
        .ok_or_else(|| AppError::not_found(format!("consumer {id} has no open event stream")))?;
    let kind = message.kind();
    tx.send(message)
        .map_err(|_| BridgeError::ChannelLost(consumer))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": kind })),
    ))
}
