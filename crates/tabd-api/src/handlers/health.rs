//! Health and static capability routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::dto::{HealthResponse, Preset, PresetsResponse};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.core.health.snapshot();
    let pool_stats = state.core.pool.stats();

    let body = HealthResponse {
        ok: !snapshot.is_recovering,
        running: !snapshot.is_recovering,
        engine: if cfg!(feature = "cdp") { "cdp" } else { "fake" },
        browser_connected: pool_stats.pool_size > 0 || !snapshot.is_recovering,
        consecutive_failures: snapshot.consecutive_failures,
        active_ops: snapshot.active_ops,
        pool_size: pool_stats.pool_size,
        active_user_ids: pool_stats.active_user_ids,
        profile_dirs_total: pool_stats.profile_dirs_total,
        recovering: snapshot.is_recovering,
    };

    let status = if snapshot.is_recovering { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (status, Json(body))
}

pub async fn presets() -> Json<PresetsResponse> {
    Json(PresetsResponse {
        presets: vec![
            Preset {
                name: "default".to_string(),
                description: "standard desktop viewport, no proxy".to_string(),
            },
            Preset {
                name: "mobile".to_string(),
                description: "mobile viewport and user agent".to_string(),
            },
        ],
    })
}
