//! Request/response JSON shapes for the HTTP surface. Kept separate from
//! `tabd-core`'s types so a wire-format change never forces a core-layer
//! edit, and vice versa.

use serde::{Deserialize, Serialize};
use tabd_core::downloads::DownloadRegistry;
use tabd_core::extraction::{BatchDownloadCandidate, BatchDownloadOutcome, ExtractOptions, ExtractedResources};
use tabd_core::pool::SeedOptions;
use tabd_core::sessions::{Tab, TabState};
use tabd_engine::params::Cookie;
use tabd_types::{DownloadInfo, TabId, UserId};

fn default_session_key() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedOptionsDto {
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub geolocation: Option<(f64, f64)>,
    #[serde(default)]
    pub viewport: Option<(u32, u32)>,
}

impl From<SeedOptionsDto> for SeedOptions {
    fn from(dto: SeedOptionsDto) -> Self {
        Self {
            locale: dto.locale,
            timezone: dto.timezone,
            geolocation: dto.geolocation,
            viewport: dto.viewport,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTabRequest {
    pub user_id: String,
    #[serde(default = "default_session_key")]
    pub session_key: String,
    #[serde(default)]
    pub seed_options: Option<SeedOptionsDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTabResponse {
    pub tab_id: TabId,
    pub session_key: String,
}

#[derive(Debug, Deserialize)]
pub struct UserIdQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuery {
    pub user_id: String,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSummary {
    pub tab_id: TabId,
    pub session_key: String,
    pub state: &'static str,
    pub tool_call_count: u64,
}

impl TabSummary {
    pub fn from_tab(tab: &Tab) -> Self {
        Self {
            tab_id: tab.tab_id,
            session_key: tab.list_item_id.clone(),
            state: state_label(tab.state()),
            tool_call_count: tab.tool_call_count.load(std::sync::atomic::Ordering::SeqCst),
        }
    }
}

pub fn state_label(state: TabState) -> &'static str {
    match state {
        TabState::Created => "created",
        TabState::Loaded => "loaded",
        TabState::Ready => "ready",
        TabState::Acting => "acting",
        TabState::Closed => "closed",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTabsResponse {
    pub tabs: Vec<TabSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateRequest {
    pub user_id: String,
    pub url: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResponse {
    pub ok: bool,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub snapshot: String,
    pub truncated: bool,
    pub total_chars: usize,
    pub offset: usize,
    pub has_more: bool,
    pub next_offset: Option<usize>,
    pub refs_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickRequest {
    pub user_id: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickResponse {
    pub ok: bool,
    pub url: String,
    pub downloads: Vec<DownloadInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRequest {
    pub user_id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub text: String,
    #[serde(default)]
    pub clear_first: bool,
    #[serde(default)]
    pub press_enter: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressRequest {
    pub user_id: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollRequest {
    pub user_id: String,
    #[serde(default)]
    pub scroll_to: Option<(f64, f64)>,
    #[serde(default)]
    pub delta: Option<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollElementRequest {
    pub user_id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub scroll_to: Option<(f64, f64)>,
    #[serde(default)]
    pub delta: Option<(f64, f64)>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollMetricsResponse {
    pub ok: bool,
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub scroll_width: f64,
    pub scroll_height: f64,
    pub client_width: f64,
    pub client_height: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRequest {
    pub user_id: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinksResponse {
    pub visited_urls: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub tab_id: TabId,
    pub state: &'static str,
    pub tool_call_count: u64,
    pub visited_url_count: usize,
    pub refs_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotQuery {
    pub user_id: String,
    #[serde(default)]
    pub full_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseGroupQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookiesImportRequest {
    pub cookies: Vec<Cookie>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CookiesResponse {
    pub cookies: Vec<Cookie>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub user_id: String,
    pub expression: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub running: bool,
    pub engine: &'static str,
    pub browser_connected: bool,
    pub consecutive_failures: u32,
    pub active_ops: u32,
    pub pool_size: usize,
    pub active_user_ids: Vec<UserId>,
    pub profile_dirs_total: usize,
    #[serde(default)]
    pub recovering: bool,
}

#[derive(Debug, Serialize)]
pub struct PresetsResponse {
    pub presets: Vec<Preset>,
}

#[derive(Debug, Serialize)]
pub struct Preset {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadsResponse {
    pub downloads: Vec<DownloadInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResourcesRequest {
    pub user_id: String,
    #[serde(default)]
    pub options: ExtractOptions,
}

#[derive(Debug, Serialize)]
pub struct ExtractResourcesResponse {
    #[serde(flatten)]
    pub resources: ExtractedResources,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveBlobsRequest {
    pub user_id: String,
    #[serde(flatten)]
    pub resources: ExtractedResources,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDownloadRequest {
    pub user_id: String,
    pub candidates: Vec<BatchDownloadCandidate>,
    #[serde(default)]
    pub resolve_blobs: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct BatchDownloadResponse {
    pub results: Vec<BatchDownloadOutcome>,
}

pub fn downloads_for_user(registry: &DownloadRegistry, user_id: &UserId) -> DownloadsResponse {
    DownloadsResponse {
        downloads: registry.list_for_user(user_id),
    }
}
