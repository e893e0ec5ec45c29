//! Router assembly: every route wired to its handler, with auth applied
//! only to the routes the spec calls out (arbitrary script, cookie import,
//! admin shutdown) rather than as a blanket allowlist-based middleware.

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_admin_key, require_bearer_auth};
use crate::handlers::{admin, downloads, health, resources, sessions, tabs};
use crate::payload_limit::PayloadLimitLayer;
use crate::state::AppState;

const MAX_PAYLOAD_BYTES: u64 = 25 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/tabs/:tabId/evaluate", post(tabs::evaluate))
        .route("/tabs/:tabId/evaluate-extended", post(tabs::evaluate_extended))
        .route("/sessions/:userId/cookies", post(sessions::import_cookies))
        .layer(from_fn_with_state(state.clone(), require_bearer_auth));

    let admin_routes = Router::new()
        .route("/admin/stop", post(admin::stop))
        .layer(from_fn_with_state(state.clone(), require_admin_key));

    let open = Router::new()
        .route("/tabs", post(tabs::create_tab).get(tabs::list_tabs))
        .route("/tabs/:tabId/navigate", post(tabs::navigate))
        .route("/tabs/:tabId/snapshot", get(tabs::snapshot))
        .route("/tabs/:tabId/click", post(tabs::click))
        .route("/tabs/:tabId/type", post(tabs::type_text))
        .route("/tabs/:tabId/press", post(tabs::press))
        .route("/tabs/:tabId/scroll", post(tabs::scroll))
        .route("/tabs/:tabId/scroll-element", post(tabs::scroll_element))
        .route("/tabs/:tabId/back", post(tabs::go_back))
        .route("/tabs/:tabId/forward", post(tabs::go_forward))
        .route("/tabs/:tabId/refresh", post(tabs::refresh))
        .route("/tabs/:tabId/wait", post(tabs::wait))
        .route("/tabs/:tabId/links", get(tabs::links))
        .route("/tabs/:tabId/screenshot", get(tabs::screenshot))
        .route("/tabs/:tabId/stats", get(tabs::stats))
        .route("/tabs/:tabId", delete(tabs::close_tab))
        .route("/tabs/group/:listItemId", delete(tabs::close_group))
        .route("/tabs/:tabId/cookies", get(tabs::get_cookies))
        .route("/tabs/:tabId/extract-resources", post(resources::extract_resources))
        .route("/tabs/:tabId/resolve-blobs", post(resources::resolve_blobs))
        .route("/tabs/:tabId/batch-download", post(resources::batch_download))
        .route("/tabs/:tabId/downloads", get(downloads::list_for_tab))
        .route("/users/:userId/downloads", get(downloads::list_for_user))
        .route(
            "/downloads/:downloadId",
            get(downloads::get_download).delete(downloads::delete_download),
        )
        .route("/downloads/:downloadId/content", get(downloads::content))
        .route("/sessions/:userId", delete(sessions::close_session))
        .route("/sessions/:userId/toggle-display", post(sessions::toggle_display))
        .route("/health", get(health::health))
        .route("/presets", get(health::presets));

    let request_timeout = state.core.config.request_timeout;

    Router::new()
        .merge(open)
        .merge(gated)
        .merge(admin_routes)
        .fallback(tabs::not_found)
        .layer(PayloadLimitLayer::with_limit(MAX_PAYLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}
