//! Admin-only routes, gated by `require_admin_key`.

use axum::extract::State;
use axum::Json;

use crate::dto::OkResponse;
use crate::state::AppState;

/// Signal graceful shutdown. `main` is waiting on `state.shutdown` alongside
/// the OS signal handlers and runs the same cleanup path either way.
pub async fn stop(State(state): State<AppState>) -> Json<OkResponse> {
    state.shutdown.notify_waiters();
    Json(OkResponse::ok())
}
