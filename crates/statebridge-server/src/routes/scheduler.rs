use axum::extract::State;
use axum::Json;
use statebridge_core::QueueStatus;

use crate::state::AppState;

pub async fn get_scheduler(State(app): State<AppState>) -> Json<QueueStatus> {
    Json(app.bridge.queue_status())
}
