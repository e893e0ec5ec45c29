//! Session-level routes: closing a user's whole session, importing cookies
//! into its browser context, and the display-mode toggle that forces a
//! fresh context.

use axum::extract::{Path, State};
use axum::Json;

use tabd_types::CoreError;

use crate::dto::{CookiesImportRequest, OkResponse};
use crate::error::{into_api_error, ApiResult};
use crate::handlers::common::parse_user_id;
use crate::state::AppState;

pub async fn close_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&user_id, &state)?;
    state.core.sessions.close_sessions_for_user(&user_id).await;
    Ok(Json(OkResponse::ok()))
}

/// Apply cookies to the user's browser context. Cookies are set on the
/// context's first existing tab, since the engine only exposes cookie jars
/// through a page handle, not the context itself — the browser shares the
/// jar across every tab in the context regardless of which page sets it.
pub async fn import_cookies(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<CookiesImportRequest>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&user_id, &state)?;
    let tabs = state.core.sessions.tabs_for_user(&user_id);
    let tab = tabs.first().ok_or_else(|| {
        into_api_error(CoreError::validation("no open tab to apply cookies through; open a tab first"), &state)
    })?;

    tab.page
        .set_cookies(&body.cookies)
        .await
        .map_err(|e| into_api_error(CoreError::engine(e.to_string()), &state))?;

    Ok(Json(OkResponse::ok()))
}

/// Restart the user's browser context, e.g. after a headless/virtual display
/// mode change that can't be applied to a running context.
pub async fn toggle_display(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&user_id, &state)?;
    state
        .core
        .pool
        .restart_context(&user_id)
        .await
        .map_err(|e| into_api_error(e, &state))?;
    Ok(Json(OkResponse::ok()))
}
