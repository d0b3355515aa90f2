use axum::extract::{Path, State};
use axum::Json;
use statebridge_core::ConsumerId;

use crate::state::AppState;

/// GET /api/consumers/{id}/subscriptions: the consumer's subscribed keys.
/// Unknown consumers have none.
pub async fn get_subscriptions(
    State(app): State<AppState>,
    Path(id): Path<u32>,
) -> Json<serde_json::Value> {
    let keys = app.bridge.subscriptions(ConsumerId(id));
    Json(serde_json::json!({ "consumer_id": id, "keys": keys }))
}
