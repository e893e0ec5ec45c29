//! Tab lifecycle and action routes: create/list/close, navigate, the
//! snapshot/ref/action pipeline, history, cookies, screenshot, stats.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tabd_core::actions::EvaluateOutcome;
use tabd_engine::params::Cookie;
use tabd_types::{CoreError, TabId};

use crate::dto::*;
use crate::error::{into_api_error, ApiError, ApiResult};
use crate::handlers::common::{parse_user_id, require_tab};
use crate::state::AppState;

const DEFAULT_NAVIGATE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
/// Window after a click within which a triggered download is folded into the
/// click's own response, so a caller doesn't have to poll `/downloads` for
/// the common "click a download link" case.
const CLICK_DOWNLOAD_INLINE_WINDOW: Duration = Duration::from_secs(3);

pub async fn create_tab(
    State(state): State<AppState>,
    Json(body): Json<CreateTabRequest>,
) -> ApiResult<Json<CreateTabResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let seed = body.seed_options.map(SeedOptionsDto::into);

    let tab = state
        .core
        .sessions
        .create_tab(&user_id, &body.session_key, seed)
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(CreateTabResponse {
        tab_id: tab.tab_id,
        session_key: body.session_key,
    }))
}

pub async fn list_tabs(
    State(state): State<AppState>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<ListTabsResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tabs = state
        .core
        .sessions
        .tabs_for_user(&user_id)
        .iter()
        .map(|tab| TabSummary::from_tab(tab))
        .collect();
    Ok(Json(ListTabsResponse { tabs }))
}

pub async fn navigate(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<NavigateRequest>,
) -> ApiResult<Json<NavigateResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let timeout = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_NAVIGATE_TIMEOUT);

    let core = state.core.clone();
    let result = core
        .concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            core.health.begin_op();
            let outcome = core.actions.navigate(&tab, &body.url, timeout).await;
            core.health.end_op();
            match &outcome {
                Ok(_) => core.health.record_nav_success(),
                Err(_) => {
                    core.health.record_nav_failure();
                }
            }
            outcome
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(NavigateResponse { ok: true, url: result }))
}

pub async fn snapshot(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Json<SnapshotResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    let offset = query.offset;
    let result = core
        .concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            Ok(core.actions.snapshot(&tab, offset).await)
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(SnapshotResponse {
        snapshot: result.window.text,
        truncated: result.window.truncated,
        total_chars: result.window.total_chars,
        offset: result.window.offset,
        has_more: result.window.has_more,
        next_offset: result.window.next_offset,
        refs_count: result.refs_count,
    }))
}

pub async fn click(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<ClickRequest>,
) -> ApiResult<Json<ClickResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    let reference = body.reference.clone();
    let url = core
        .concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            tab.bump_tool_calls();
            core.actions.click(&tab, &reference).await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    let downloads = state
        .core
        .downloads
        .recent_for_tab(tab_id, CLICK_DOWNLOAD_INLINE_WINDOW);

    Ok(Json(ClickResponse { ok: true, url, downloads }))
}

pub async fn type_text(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<TypeRequest>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            tab.bump_tool_calls();
            core.actions
                .type_text(&tab, &body.reference, &body.text, body.clear_first, body.press_enter)
                .await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(OkResponse::ok()))
}

pub async fn press(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<PressRequest>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            tab.bump_tool_calls();
            core.actions.press_key(&tab, &body.key).await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(OkResponse::ok()))
}

pub async fn scroll(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<ScrollRequest>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            core.actions.scroll(&tab, body.scroll_to, body.delta).await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(OkResponse::ok()))
}

pub async fn scroll_element(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<ScrollElementRequest>,
) -> ApiResult<Json<ScrollMetricsResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    let reference = body.reference.clone();
    let metrics = core
        .concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            core.actions
                .scroll_element(&tab, &reference, body.scroll_to, body.delta)
                .await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(ScrollMetricsResponse {
        ok: true,
        scroll_top: metrics.scroll_top,
        scroll_left: metrics.scroll_left,
        scroll_width: metrics.scroll_width,
        scroll_height: metrics.scroll_height,
        client_width: metrics.client_width,
        client_height: metrics.client_height,
    }))
}

pub async fn go_back(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async { core.actions.go_back(&tab).await })
        .await
        .map_err(|e| into_api_error(e, &state))?;
    Ok(Json(OkResponse::ok()))
}

pub async fn go_forward(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async { core.actions.go_forward(&tab).await })
        .await
        .map_err(|e| into_api_error(e, &state))?;
    Ok(Json(OkResponse::ok()))
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async { core.actions.refresh(&tab).await })
        .await
        .map_err(|e| into_api_error(e, &state))?;
    Ok(Json(OkResponse::ok()))
}

pub async fn wait(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<WaitRequest>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let timeout = body.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT_TIMEOUT);

    let core = state.core.clone();
    core.concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            core.actions.wait(&tab, timeout).await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(OkResponse::ok()))
}

pub async fn screenshot(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<ScreenshotQuery>,
) -> ApiResult<impl IntoResponse> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;

    let core = state.core.clone();
    let full_page = query.full_page;
    let bytes = core
        .concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            core.actions.screenshot(&tab, full_page).await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}

pub async fn links(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<LinksResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let visited_urls = tab.visited_urls.lock().await.clone();
    Ok(Json(LinksResponse { visited_urls }))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<StatsResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let visited_url_count = tab.visited_urls.lock().await.len();
    let refs_count = tab.refs.lock().await.len();
    Ok(Json(StatsResponse {
        tab_id: tab.tab_id,
        state: state_label(tab.state()),
        tool_call_count: tab.tool_call_count.load(std::sync::atomic::Ordering::SeqCst),
        visited_url_count,
        refs_count,
    }))
}

pub async fn close_tab(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    tab.page.close().await.map_err(|e| into_api_error(CoreError::engine(e.to_string()), &state))?;
    state.core.actions.clear_tab_lock(&tab);
    state.core.sessions.remove_tab(&tab_id, &user_id);
    Ok(Json(OkResponse::ok()))
}

pub async fn close_group(
    State(state): State<AppState>,
    Path(list_item_id): Path<String>,
    Query(query): Query<CloseGroupQuery>,
) -> ApiResult<Json<OkResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    state.core.sessions.close_group(&user_id, &list_item_id);
    Ok(Json(OkResponse::ok()))
}

pub async fn get_cookies(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Query(query): Query<UserIdQuery>,
) -> ApiResult<Json<CookiesResponse>> {
    let user_id = parse_user_id(&query.user_id, &state)?;
    let tab = require_tab(&state, &tab_id, &user_id)?;
    let cookies: Vec<Cookie> = tab
        .page
        .get_cookies()
        .await
        .map_err(|e| into_api_error(CoreError::engine(e.to_string()), &state))?;
    Ok(Json(CookiesResponse { cookies }))
}

pub async fn evaluate(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<EvaluateRequest>,
) -> ApiResult<Json<EvaluateResponse>> {
    run_evaluate(state, tab_id, body, Duration::from_secs(30), None).await
}

pub async fn evaluate_extended(
    State(state): State<AppState>,
    Path(tab_id): Path<TabId>,
    Json(body): Json<EvaluateRequest>,
) -> ApiResult<Json<EvaluateResponse>> {
    let user_id = parse_user_id(&body.user_id, &state)?;
    let check = state.core.ratelimit.check(
        &user_id,
        state.core.config.rate_limit_eval_extended_max,
        Duration::from_secs(60),
    );
    if !check.allowed {
        return Err(into_api_error(
            CoreError::rate_limited("evaluate-extended rate limit exceeded", check.retry_after.unwrap_or_default()),
            &state,
        ));
    }
    run_evaluate(state, tab_id, body, Duration::from_secs(300), Some(user_id)).await
}

async fn run_evaluate(
    state: AppState,
    tab_id: TabId,
    body: EvaluateRequest,
    ceiling: Duration,
    user_id: Option<tabd_types::UserId>,
) -> ApiResult<Json<EvaluateResponse>> {
    let user_id = match user_id {
        Some(u) => u,
        None => parse_user_id(&body.user_id, &state)?,
    };
    let tab = require_tab(&state, &tab_id, &user_id)?;

    // Caller-requested timeout, clamped to [100ms, this route's ceiling].
    let timeout = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(ceiling)
        .clamp(Duration::from_millis(100), ceiling);

    let core = state.core.clone();
    let expression = body.expression.clone();
    let outcome = core
        .concurrency
        .with_user_limit(&user_id, core.config.max_concurrency_per_user, || async {
            core.actions.evaluate(&tab, &expression, timeout).await
        })
        .await
        .map_err(|e| into_api_error(e, &state))?;

    Ok(Json(match outcome {
        EvaluateOutcome::Timeout => EvaluateResponse {
            ok: false,
            error_type: Some("timeout"),
            value: None,
            result_type: None,
            truncated: None,
            message: Some("evaluation timed out".to_string()),
        },
        EvaluateOutcome::JsError(msg) => EvaluateResponse {
            ok: false,
            error_type: Some("js_error"),
            value: None,
            result_type: None,
            truncated: None,
            message: Some(msg),
        },
        EvaluateOutcome::Value { value, result_type, truncated } => EvaluateResponse {
            ok: true,
            error_type: None,
            value: Some(value),
            result_type: Some(result_type),
            truncated: Some(truncated),
            message: None,
        },
    }))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "route not found"})))
}
