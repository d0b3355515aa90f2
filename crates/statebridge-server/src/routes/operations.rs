use axum::extract::State;
use axum::Json;
use statebridge_core::ActiveOperationsSummary;

use crate::state::AppState;

/// GET /api/operations: live thunks and the registry version.
pub async fn get_operations(State(app): State<AppState>) -> Json<ActiveOperationsSummary> {
    Json(app.bridge.summary())
}
