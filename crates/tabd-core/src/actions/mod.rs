//! Click/type/press/scroll/back/forward/refresh/evaluate, and the
//! snapshot-building pipeline they share.

pub mod readiness;
pub mod refs;

use std::time::Duration;

use serde_json::Value;
use tabd_engine::error::EngineError;
use tabd_engine::params::{BoundingBox, ClickOptions, LoadState, ScreenshotParams};
use tabd_types::{CoreError, CoreResult, RefId};
use tracing::warn;

use crate::sessions::tab_lock::TabLocks;
use crate::sessions::{Tab, TabState};
use refs::{build_annotated_snapshot, window_snapshot, SnapshotWindow};

const ARIA_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(12);
const ARIA_SNAPSHOT_RETRY_LOAD_WAIT: Duration = Duration::from_secs(5);
const MAX_SNAPSHOT_CHARS: usize = 80_000;
const SNAPSHOT_TAIL_CHARS: usize = 5_000;
const EVALUATE_MAX_EXPRESSION_BYTES: usize = 64 * 1024;
const EVALUATE_SERIALIZED_CAP_BYTES: usize = 1024 * 1024;

pub struct ActionsConfig {
    pub max_snapshot_chars: usize,
    pub snapshot_tail_chars: usize,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            max_snapshot_chars: MAX_SNAPSHOT_CHARS,
            snapshot_tail_chars: SNAPSHOT_TAIL_CHARS,
        }
    }
}

pub struct ActionsEngine {
    tab_locks: TabLocks,
    config: ActionsConfig,
}

pub struct SnapshotResult {
    pub window: SnapshotWindow,
    pub refs_count: usize,
}

pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub scroll_width: f64,
    pub scroll_height: f64,
    pub client_width: f64,
    pub client_height: f64,
}

pub enum EvaluateOutcome {
    Timeout,
    JsError(String),
    Value { value: Value, result_type: String, truncated: bool },
}

impl ActionsEngine {
    pub fn new(config: ActionsConfig) -> Self {
        Self {
            tab_locks: TabLocks::new(),
            config,
        }
    }

    pub fn clear_tab_lock(&self, tab: &Tab) {
        self.tab_locks.clear_tab_lock(&tab.tab_id);
    }

    /// URL scheme gate: reject anything but http(s) before ever touching
    /// the tab.
    pub fn validate_navigable_url(url: &str) -> CoreResult<()> {
        let parsed = url::Url::parse(url).map_err(|e| CoreError::validation(format!("invalid url: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(CoreError::validation("only http(s) URLs may be navigated to"));
        }
        Ok(())
    }

    pub async fn navigate(&self, tab: &Tab, url: &str, timeout: Duration) -> CoreResult<String> {
        Self::validate_navigable_url(url)?;
        let url = url.to_string();
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                let params = readiness::navigate_params(timeout);
                let result = tab
                    .page
                    .goto(&url, params)
                    .await
                    .map_err(|e| CoreError::engine(e.to_string()));

                // Navigation invalidates refs atomically before anything rebuilds them.
                {
                    let mut table = tab.refs.lock().await;
                    table.clear();
                }
                *tab.last_snapshot.lock().await = None;

                match result {
                    Ok(()) => {
                        let final_url = tab
                            .page
                            .current_url()
                            .await
                            .map_err(|e| CoreError::engine(e.to_string()))?;
                        tab.record_visit(final_url.clone()).await;
                        tab.set_state(TabState::Loaded);
                        Ok(final_url)
                    }
                    Err(e) => {
                        tab.set_state(TabState::Loaded);
                        Err(e)
                    }
                }
            })
            .await
    }

    /// The central snapshot-building routine: page readiness, best-effort
    /// consent dismissal, a bounded aria-tree fetch (one retry), then ref
    /// extraction + annotation. Never throws — both snapshot failures
    /// resolve to an empty ref table.
    async fn build_ref_table(&self, tab: &Tab) -> (String, usize) {
        readiness::wait_for_page_ready(tab.page.as_ref()).await;
        readiness::dismiss_consent(tab.page.as_ref()).await;

        let raw = match tab.page.aria_snapshot(ARIA_SNAPSHOT_TIMEOUT).await {
            Ok(text) => text,
            Err(_) => {
                let _ = tab
                    .page
                    .wait_for_load_state(LoadState::Load, ARIA_SNAPSHOT_RETRY_LOAD_WAIT)
                    .await;
                match tab.page.aria_snapshot(ARIA_SNAPSHOT_TIMEOUT).await {
                    Ok(text) => text,
                    Err(_) => String::new(),
                }
            }
        };

        let annotated = build_annotated_snapshot(&raw);
        let refs_count = annotated.table.len();
        {
            let mut table = tab.refs.lock().await;
            *table = annotated.table;
        }
        *tab.last_snapshot.lock().await = Some(annotated.annotated_text.clone());
        tab.set_state(TabState::Ready);
        (annotated.annotated_text, refs_count)
    }

    pub async fn snapshot(&self, tab: &Tab, offset: usize) -> SnapshotResult {
        let (annotated_text, refs_count) = self.build_ref_table(tab).await;
        let window = window_snapshot(
            &annotated_text,
            offset,
            self.config.max_snapshot_chars,
            self.config.snapshot_tail_chars,
        );
        SnapshotResult { window, refs_count }
    }

    async fn resolve_locator(
        &self,
        tab: &Tab,
        ref_id: &str,
    ) -> CoreResult<Box<dyn tabd_engine::traits::ElementLocator>> {
        let parsed = RefId::parse(ref_id).ok_or_else(|| CoreError::validation(format!("malformed ref id {ref_id}")))?;
        let info = {
            let table = tab.refs.lock().await;
            table
                .resolve(&parsed)
                .cloned()
                .ok_or_else(|| CoreError::validation(table.valid_range_message()))?
        };
        tab.page
            .locator_by_role(&info.role, &info.name, info.nth)
            .await
            .map_err(|e| CoreError::validation(e.to_string()))
    }

    /// Click escalation: plain click, then `force: true` if the engine
    /// reports pointer-event interception, then a synthetic mouse sequence
    /// over the element's bounding-box center.
    pub async fn click(&self, tab: &Tab, ref_id: &str) -> CoreResult<String> {
        let ref_id = ref_id.to_string();
        let result = self
            .tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                let locator = self.resolve_locator(tab, &ref_id).await?;

                let normal = locator.click(ClickOptions::default()).await;
                let outcome = match normal {
                    Ok(()) => Ok(()),
                    Err(e) if e.mentions_pointer_interception() => {
                        locator.click(ClickOptions { force: true }).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    warn!(ref_id = %ref_id, error = %e, "falling back to synthetic mouse sequence for click");
                    self.synthetic_click(tab, locator.as_ref()).await?;
                }

                let url = tab.page.current_url().await.map_err(|e| CoreError::engine(e.to_string()))?;
                tab.record_visit(url.clone()).await;
                Ok(url)
            })
            .await?;
        self.build_ref_table(tab).await;
        Ok(result)
    }

    /// Move to the element's bounding-box center, then a synthetic
    /// down/up pair, as the last rung of the click escalation ladder.
    async fn synthetic_click(
        &self,
        tab: &Tab,
        locator: &dyn tabd_engine::traits::ElementLocator,
    ) -> CoreResult<()> {
        let bbox: BoundingBox = locator
            .bounding_box()
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?
            .ok_or_else(|| CoreError::validation("element has no bounding box"))?;
        let (x, y) = bbox.center();

        tab.page.mouse_move(x, y).await.map_err(|e| CoreError::engine(e.to_string()))?;
        tab.page.wait_for_timeout(Duration::from_millis(30)).await;
        tab.page.mouse_down().await.map_err(|e| CoreError::engine(e.to_string()))?;
        tab.page.wait_for_timeout(Duration::from_millis(30)).await;
        tab.page.mouse_up().await.map_err(|e| CoreError::engine(e.to_string()))
    }

    /// Clears the field first when requested, fills, then optionally presses
    /// Enter as a separate keyboard step after the fill settles.
    pub async fn type_text(&self, tab: &Tab, ref_id: &str, text: &str, clear_first: bool, press_enter: bool) -> CoreResult<()> {
        let ref_id = ref_id.to_string();
        let text = text.to_string();
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                let locator = self.resolve_locator(tab, &ref_id).await?;
                locator
                    .fill(&text, clear_first)
                    .await
                    .map_err(|e| CoreError::engine(e.to_string()))?;
                if press_enter {
                    tab.page
                        .keyboard_press("Enter")
                        .await
                        .map_err(|e| CoreError::engine(e.to_string()))?;
                }
                Ok(())
            })
            .await?;
        self.build_ref_table(tab).await;
        Ok(())
    }

    pub async fn press_key(&self, tab: &Tab, key: &str) -> CoreResult<()> {
        let key = key.to_string();
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                tab.page.keyboard_press(&key).await.map_err(|e| CoreError::engine(e.to_string()))
            })
            .await?;
        self.build_ref_table(tab).await;
        Ok(())
    }

    /// Absolute `scrollTo {top, left}` or relative `deltaX/deltaY` (default
    /// `deltaY = 300`), applied to the whole page.
    pub async fn scroll(&self, tab: &Tab, scroll_to: Option<(f64, f64)>, delta: Option<(f64, f64)>) -> CoreResult<()> {
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                if let Some((top, left)) = scroll_to {
                    let script = format!("window.scrollTo({left}, {top})");
                    tab.page.evaluate(&script).await.map_err(|e| CoreError::engine(e.to_string()))?;
                } else {
                    let (dx, dy) = delta.unwrap_or((0.0, 300.0));
                    tab.page.mouse_wheel(dx, dy).await.map_err(|e| CoreError::engine(e.to_string()))?;
                }
                Ok(())
            })
            .await
    }

    pub async fn scroll_element(&self, tab: &Tab, ref_id: &str, scroll_to: Option<(f64, f64)>, delta: Option<(f64, f64)>) -> CoreResult<ScrollMetrics> {
        let ref_id = ref_id.to_string();
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                let locator = self.resolve_locator(tab, &ref_id).await?;
                let script = if let Some((top, left)) = scroll_to {
                    format!("el => {{ el.scrollTop = {top}; el.scrollLeft = {left}; }}")
                } else {
                    let (dx, dy) = delta.unwrap_or((0.0, 300.0));
                    format!("el => {{ el.scrollTop += {dy}; el.scrollLeft += {dx}; }}")
                };
                locator.evaluate(&script).await.map_err(|e| CoreError::engine(e.to_string()))?;

                let metrics_script = "el => ({ scrollTop: el.scrollTop, scrollLeft: el.scrollLeft, scrollWidth: el.scrollWidth, scrollHeight: el.scrollHeight, clientWidth: el.clientWidth, clientHeight: el.clientHeight })";
                let value = locator.evaluate(metrics_script).await.map_err(|e| CoreError::engine(e.to_string()))?;
                parse_scroll_metrics(&value)
            })
            .await
    }

    pub async fn go_back(&self, tab: &Tab) -> CoreResult<()> {
        self.navigate_history(tab, |p| Box::pin(p.go_back())).await
    }

    pub async fn go_forward(&self, tab: &Tab) -> CoreResult<()> {
        self.navigate_history(tab, |p| Box::pin(p.go_forward())).await
    }

    pub async fn refresh(&self, tab: &Tab) -> CoreResult<()> {
        self.navigate_history(tab, |p| Box::pin(p.reload())).await
    }

    async fn navigate_history<'a, F>(&self, tab: &'a Tab, op: F) -> CoreResult<()>
    where
        F: for<'b> FnOnce(&'b dyn tabd_engine::traits::PageHandle) -> std::pin::Pin<Box<dyn std::future::Future<Output = tabd_engine::error::EngineResult<()>> + Send + 'b>>,
    {
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                op(tab.page.as_ref()).await.map_err(|e| CoreError::engine(e.to_string()))?;
                let mut table = tab.refs.lock().await;
                table.clear();
                Ok(())
            })
            .await?;
        self.build_ref_table(tab).await;
        Ok(())
    }

    /// Run the same page-readiness wait `snapshot` uses, under the tab lock,
    /// without building or returning a snapshot. Lets a caller block on
    /// hydration finishing before issuing a batch of actions.
    pub async fn wait(&self, tab: &Tab, timeout: Duration) -> CoreResult<()> {
        self.tab_locks
            .with_tab_lock(tab.tab_id, || async {
                tab.set_state(TabState::Acting);
                let waited = tokio::time::timeout(timeout, readiness::wait_for_page_ready(tab.page.as_ref())).await;
                if waited.is_err() {
                    warn!(tab_id = %tab.tab_id, "wait timed out before the page settled");
                }
                tab.set_state(TabState::Loaded);
                Ok(())
            })
            .await
    }

    pub async fn screenshot(&self, tab: &Tab, full_page: bool) -> CoreResult<Vec<u8>> {
        tab.page
            .screenshot(ScreenshotParams { full_page })
            .await
            .map_err(|e| CoreError::engine(e.to_string()))
    }

    /// Both `/evaluate` and `/evaluate-extended` share this implementation;
    /// the caller picks the timeout ceiling (30s vs 300s).
    pub async fn evaluate(&self, tab: &Tab, expression: &str, timeout: Duration) -> CoreResult<EvaluateOutcome> {
        if expression.len() > EVALUATE_MAX_EXPRESSION_BYTES {
            return Err(CoreError::validation("expression exceeds the 64KB limit"));
        }
        let timeout = timeout.max(Duration::from_millis(100));

        let eval = tokio::time::timeout(timeout, tab.page.evaluate(expression)).await;
        match eval {
            Err(_) => Ok(EvaluateOutcome::Timeout),
            Ok(Err(EngineError::Evaluation(msg))) => Ok(EvaluateOutcome::JsError(msg)),
            Ok(Err(e)) => Err(CoreError::engine(e.to_string())),
            Ok(Ok(value)) => Ok(classify_evaluate_result(value)),
        }
    }
}

fn classify_evaluate_result(value: Value) -> EvaluateOutcome {
    if value.is_null() {
        return EvaluateOutcome::Value {
            value,
            result_type: "null".to_string(),
            truncated: false,
        };
    }
    let result_type = match &value {
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    }
    .to_string();

    let serialized = serde_json::to_string(&value).unwrap_or_default();
    if serialized.len() > EVALUATE_SERIALIZED_CAP_BYTES {
        return EvaluateOutcome::Value {
            value: Value::String("<truncated: result exceeded 1MB>".to_string()),
            result_type,
            truncated: true,
        };
    }
    EvaluateOutcome::Value {
        value,
        result_type,
        truncated: false,
    }
}

fn parse_scroll_metrics(value: &Value) -> CoreResult<ScrollMetrics> {
    let get = |key: &str| -> f64 { value.get(key).and_then(Value::as_f64).unwrap_or(0.0) };
    Ok(ScrollMetrics {
        scroll_top: get("scrollTop"),
        scroll_left: get("scrollLeft"),
        scroll_width: get("scrollWidth"),
        scroll_height: get("scrollHeight"),
        client_width: get("clientWidth"),
        client_height: get("clientHeight"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabd_engine::fake::FakePage;
    use std::sync::Arc;

    fn tab_with_page(page: FakePage) -> Tab {
        Tab::new_for_test(Arc::new(page))
    }

    #[tokio::test]
    async fn navigate_rejects_non_http_schemes() {
        let engine = ActionsEngine::new(ActionsConfig::default());
        let tab = tab_with_page(FakePage::new());
        let result = engine.navigate(&tab, "file:///etc/passwd", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn navigate_clears_refs_and_records_visit() {
        let engine = ActionsEngine::new(ActionsConfig::default());
        let page = FakePage::new();
        page.set_snapshot("- button \"Go\"");
        let tab = tab_with_page(page.clone());

        engine.snapshot(&tab, 0).await;
        assert!(tab.refs.lock().await.len() > 0);

        engine.navigate(&tab, "https://example.com/page", Duration::from_secs(5)).await.unwrap();
        assert_eq!(page.visited_urls(), vec!["https://example.com/page"]);
    }

    #[tokio::test]
    async fn evaluate_times_out_cleanly() {
        let engine = ActionsEngine::new(ActionsConfig::default());
        let page = FakePage::new();
        page.set_eval_delay(Duration::from_millis(200));
        let tab = tab_with_page(page);

        let outcome = engine.evaluate(&tab, "1+1", Duration::from_millis(10)).await.unwrap();
        assert!(matches!(outcome, EvaluateOutcome::Timeout));
    }

    #[tokio::test]
    async fn evaluate_reports_js_errors_distinctly() {
        let engine = ActionsEngine::new(ActionsConfig::default());
        let page = FakePage::new();
        page.set_eval_error("ReferenceError: x is not defined");
        let tab = tab_with_page(page);

        let outcome = engine.evaluate(&tab, "x", Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, EvaluateOutcome::JsError(_)));
    }
}
