//! Download registry routes: per-tab/per-user listings, metadata lookup,
//! deletion, and serving finished file content back to the caller.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use tabd_types::{CoreError, TabId};

use crate::dto::{downloads_for_user, DownloadsResponse, OkResponse, UserIdQuery};
use crate::error::{into_api_error, ApiResult};
use crate::handlers::common::{parse_user_id, require_tab};
use crate::state::AppState;

pub async fn list_for_tab(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<DownloadsResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    // `/tabs/:tabId/*` always 404s on a userId that doesn't own the tab,
    // same as every other tab route, rather than letting a guessed tabId
    // enumerate another tenant's download records.
    require_tab(&state, &tab_id, &user_id)?;
    Ok(Json(DownloadsResponse {
        downloads: state.core.downloads.list_for_tab(tab_id),
    }))
}

pub async fn list_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<DownloadsResponse>> {
    let user_id = parse_user_id(&user_id, &state)?;
    Ok(Json(downloads_for_user(&state.core.downloads, &user_id)))
}

pub async fn get_download(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<Json<tabd_types::DownloadInfo>> {
    state
        .core
        .downloads
        .get(&download_id)
        .map(Json)
        .ok_or_else(|| into_api_error(CoreError::not_found(format!("download {download_id} not found")), &state))
}

pub async fn delete_download(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    state
        .core
        .downloads
        .delete(&download_id)
        .await
        .map_err(|e| into_api_error(e, &state))?;
    Ok(Json(OkResponse::ok()))
}

pub async fn content(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let info = state
        .core
        .downloads
        .get(&download_id)
        .ok_or_else(|| into_api_error(CoreError::not_found(format!("download {download_id} not found")), &state))?;
    let path = state
        .core
        .downloads
        .content_path(&download_id)
        .map_err(|e| into_api_error(e, &state))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| into_api_error(CoreError::engine(format!("reading download content: {e}")), &state))?;

    let disposition = format!("attachment; filename=\"{}\"", info.suggested_filename.replace('"', ""));
    Ok((
        [(header::CONTENT_TYPE, info.mime_type), (header::CONTENT_DISPOSITION, disposition)],
        bytes,
    ))
}
