//! Maps `CoreError` onto the HTTP boundary: a status code, an optional
//! `Retry-After` header, and a flat `{error: string}` JSON body.
//!
//! `CoreError` itself stays HTTP-agnostic (see `tabd-types`); only this
//! module knows about status codes, so the mapping lives in exactly one
//! place instead of being duplicated across handlers.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tabd_types::CoreError;
use tracing::{error, warn};

use crate::state::AppState;

/// Wraps a `CoreError` together with whatever ambient context the response
/// needs but `CoreError` doesn't carry (currently just `node_env`).
pub struct ApiError {
    inner: CoreError,
    hide_engine_detail: bool,
}

impl ApiError {
    pub fn new(inner: CoreError, state: &AppState) -> Self {
        Self {
            hide_engine_detail: state.core.config.node_env.is_production(),
            inner,
        }
    }
}

fn status_code(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Auth(_) => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        CoreError::ConcurrencyBusy(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::EngineError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.inner);

        if status.is_server_error() {
            error!(error = %self.inner, "request failed");
        } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
            warn!(error = %self.inner, "request rejected");
        }

        let message = match &self.inner {
            CoreError::EngineError(detail) if self.hide_engine_detail => {
                let _ = detail;
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();

        if let CoreError::RateLimited { retry_after, .. } = &self.inner {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

/// Convenience alias so handlers can write `-> ApiResult<Json<T>>`.
pub type ApiResult<T> = Result<T, ApiError>;

/// Bundles a `CoreError` with the state needed to render it, for use with
/// `.map_err(|e| into_api_error(e, &state))?`.
pub fn into_api_error(err: CoreError, state: &AppState) -> ApiError {
    ApiError::new(err, state)
}
