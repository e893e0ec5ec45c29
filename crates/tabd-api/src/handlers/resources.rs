//! Scoped resource extraction and the batch downloader built on top of it.

use axum::extract::{Path, State};
use axum::Json;
use tabd_core::extraction::{BatchDownloadCandidate, BatchDownloaderConfig, BatchDownloader, ResourceExtractor};
use tabd_types::{CoreError, TabId};

use crate::dto::{
    BatchDownloadRequest, BatchDownloadResponse, ExtractResourcesRequest, ExtractResourcesResponse,
    ResolveBlobsRequest,
};
use crate::error::{into_api_error, ApiResult};
use crate::handlers::common::{parse_user_id, require_tab};
use crate::state::AppState;

pub async fn extract_resources(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<ExtractResourcesRequest>,
) -> ApiResult<Json<ExtractResourcesResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let resources = ResourceExtractor::extract(tab.page.as_ref(), &body.options)
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(ExtractResourcesResponse { resources }))
}

pub async fn resolve_blobs(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<ResolveBlobsRequest>,
) -> ApiResult<Json<ExtractResourcesResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let resources = ResourceExtractor::resolve_blobs(tab.page.as_ref(), body.resources)
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(ExtractResourcesResponse { resources }))
}

pub async fn batch_download(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<BatchDownloadRequest>,
) -> ApiResult<Json<BatchDownloadResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let session = state
        .core
        .sessions
        .get_session(&user_id, None)
        .await
        .map_err(|e| into_api_error(e, &state))?;
    let context = session.context();

    let config = BatchDownloaderConfig {
        max_files: state.core.config.max_batch_files,
        max_batch_concurrency: state.core.config.batch_concurrency,
        max_blob_size_mb: state.core.config.max_blob_size_mb,
        max_download_size_mb: state.core.config.max_download_size_mb,
        resolve_blobs: body.resolve_blobs.unwrap_or(true),
    };

    let candidates: Vec<BatchDownloadCandidate> = body.candidates;
    if candidates.is_empty() {
        return Err(into_api_error(CoreError::validation("candidates must not be empty"), &state));
    }

    let results = BatchDownloader::run(
        &state.core.downloads,
        context.as_ref(),
        tab.page.as_ref(),
        &user_id,
        tab_id,
        candidates,
        &config,
    )
    .await
    .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(BatchDownloadResponse { results }))
}
