use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// GET /api/state: the full store state as the applier sees it.
pub async fn get_state(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(app.bridge.state())
}
