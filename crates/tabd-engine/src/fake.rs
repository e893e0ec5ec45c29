//! An in-memory engine used by `tabd-core`'s test suite.
//!
//! Mirrors the shape of a real CDP-backed context closely enough to drive
//! the orchestrator's concurrency/lifecycle contracts (tab locking,
//! navigation, ref resolution, download events) without a real browser.
//! Test code configures behavior through the `Fake*::set_*` hooks before
//! handing the handle to the code under test.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{EngineError, EngineResult};
use crate::params::{BoundingBox, ClickOptions, Cookie, LoadState, NavigateParams, ScreenshotParams};
use crate::traits::{BrowserContext, DownloadEvent, DownloadHandle, ElementLocator, PageHandle};

#[derive(Default)]
struct FakeNode {
    role: String,
    name: String,
    visible: bool,
    bounding_box: Option<BoundingBox>,
    click_count: usize,
    /// Fails the first `force: false` click with a pointer-interception
    /// message, so tests can exercise the click escalation ladder.
    intercept_once: bool,
}

struct PageState {
    url: String,
    title: String,
    closed: bool,
    snapshot: String,
    nodes: Vec<FakeNode>,
    eval_result: Value,
    eval_error: Option<String>,
    eval_delay: Duration,
    visited: Vec<String>,
    cookies: Vec<Cookie>,
}

/// Shared handle to a fake page's mutable state, for test setup.
#[derive(Clone)]
pub struct FakePage {
    state: Arc<Mutex<PageState>>,
    downloads: Arc<broadcast::Sender<DownloadEvent>>,
    closed_flag: Arc<AtomicBool>,
}

impl FakePage {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(PageState {
                url: "about:blank".to_string(),
                title: String::new(),
                closed: false,
                snapshot: String::new(),
                nodes: Vec::new(),
                eval_result: Value::Null,
                eval_error: None,
                eval_delay: Duration::ZERO,
                visited: Vec::new(),
                cookies: Vec::new(),
            })),
            downloads: Arc::new(tx),
            closed_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_snapshot(&self, yaml: impl Into<String>) {
        self.state.lock().unwrap().snapshot = yaml.into();
    }

    pub fn register_node(&self, role: &str, name: &str, visible: bool) {
        self.state.lock().unwrap().nodes.push(FakeNode {
            role: role.to_string(),
            name: name.to_string(),
            visible,
            bounding_box: Some(BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            }),
            click_count: 0,
            intercept_once: false,
        });
    }

    pub fn set_eval_result(&self, value: Value) {
        let mut s = self.state.lock().unwrap();
        s.eval_result = value;
        s.eval_error = None;
    }

    pub fn set_eval_error(&self, message: impl Into<String>) {
        self.state.lock().unwrap().eval_error = Some(message.into());
    }

    pub fn set_eval_delay(&self, delay: Duration) {
        self.state.lock().unwrap().eval_delay = delay;
    }

    pub fn visited_urls(&self) -> Vec<String> {
        self.state.lock().unwrap().visited.clone()
    }

    pub fn set_cookies_for_test(&self, cookies: Vec<Cookie>) {
        self.state.lock().unwrap().cookies = cookies;
    }

    pub fn emit_download(&self, suggested_filename: &str, url: &str, fails: Option<String>) {
        let handle: Arc<dyn DownloadHandle> = Arc::new(FakeDownloadHandle { fails });
        let _ = self.downloads.send(DownloadEvent {
            suggested_filename: suggested_filename.to_string(),
            url: url.to_string(),
            handle,
        });
    }
}

impl Default for FakePage {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeDownloadHandle {
    fails: Option<String>,
}

#[async_trait]
impl DownloadHandle for FakeDownloadHandle {
    async fn save_as(&self, path: &Path) -> EngineResult<()> {
        if self.fails.is_some() {
            return Ok(());
        }
        tokio::fs::write(path, b"fake-download-bytes")
            .await
            .map_err(|e| EngineError::Other(e.to_string()))
    }

    async fn failure(&self) -> Option<String> {
        self.fails.clone()
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, url: &str, _params: NavigateParams) -> EngineResult<()> {
        let mut s = self.state.lock().unwrap();
        s.url = url.to_string();
        s.visited.push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> EngineResult<String> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn title(&self) -> EngineResult<String> {
        Ok(self.state.lock().unwrap().title.clone())
    }

    async fn reload(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn go_back(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn go_forward(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.lock().unwrap().closed = true;
        self.closed_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    async fn evaluate(&self, _expression: &str) -> EngineResult<Value> {
        let (delay, error, result) = {
            let s = self.state.lock().unwrap();
            (s.eval_delay, s.eval_error.clone(), s.eval_result.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = error {
            return Err(EngineError::Evaluation(msg));
        }
        Ok(result)
    }

    async fn screenshot(&self, _params: ScreenshotParams) -> EngineResult<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn wait_for_load_state(&self, _state: LoadState, _timeout: Duration) -> EngineResult<()> {
        Ok(())
    }

    async fn wait_for_timeout(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn aria_snapshot(&self, _timeout: Duration) -> EngineResult<String> {
        Ok(self.state.lock().unwrap().snapshot.clone())
    }

    async fn keyboard_press(&self, _key: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn mouse_move(&self, _x: f64, _y: f64) -> EngineResult<()> {
        Ok(())
    }

    async fn mouse_down(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn mouse_up(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn mouse_wheel(&self, _delta_x: f64, _delta_y: f64) -> EngineResult<()> {
        Ok(())
    }

    async fn locator_by_role(
        &self,
        role: &str,
        name: &str,
        nth: usize,
    ) -> EngineResult<Box<dyn ElementLocator>> {
        let matches: Vec<usize> = {
            let s = self.state.lock().unwrap();
            s.nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.role == role && n.name == name)
                .map(|(i, _)| i)
                .collect()
        };
        let index = matches
            .get(nth)
            .copied()
            .ok_or_else(|| EngineError::ElementNotFound(format!("{role} \"{name}\" nth={nth}")))?;
        Ok(Box::new(FakeLocator {
            state: self.state.clone(),
            index,
        }))
    }

    async fn locator_by_selector(&self, selector: &str) -> EngineResult<Box<dyn ElementLocator>> {
        // Fake resolution: selector text is matched against registered node names.
        let index = {
            let s = self.state.lock().unwrap();
            s.nodes.iter().position(|n| n.name.contains(selector))
        };
        let index = index.ok_or_else(|| EngineError::ElementNotFound(selector.to_string()))?;
        Ok(Box::new(FakeLocator {
            state: self.state.clone(),
            index,
        }))
    }

    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }

    async fn get_cookies(&self) -> EngineResult<Vec<Cookie>> {
        Ok(self.state.lock().unwrap().cookies.clone())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> EngineResult<()> {
        let mut s = self.state.lock().unwrap();
        for cookie in cookies {
            if let Some(existing) = s.cookies.iter_mut().find(|c| c.name == cookie.name) {
                *existing = cookie.clone();
            } else {
                s.cookies.push(cookie.clone());
            }
        }
        Ok(())
    }
}

struct FakeLocator {
    state: Arc<Mutex<PageState>>,
    index: usize,
}

#[async_trait]
impl ElementLocator for FakeLocator {
    async fn click(&self, opts: ClickOptions) -> EngineResult<()> {
        let mut s = self.state.lock().unwrap();
        let node = &mut s.nodes[self.index];
        if node.intercept_once && !opts.force {
            node.intercept_once = false;
            return Err(EngineError::Other(
                "click intercepted by another element".to_string(),
            ));
        }
        node.click_count += 1;
        Ok(())
    }

    async fn fill(&self, _text: &str, _clear_first: bool) -> EngineResult<()> {
        Ok(())
    }

    async fn hover(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn scroll_into_view_if_needed(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn bounding_box(&self) -> EngineResult<Option<BoundingBox>> {
        Ok(self.state.lock().unwrap().nodes[self.index].bounding_box)
    }

    async fn evaluate(&self, _expression: &str) -> EngineResult<Value> {
        Ok(Value::Null)
    }

    async fn is_visible(&self) -> EngineResult<bool> {
        Ok(self.state.lock().unwrap().nodes[self.index].visible)
    }
}

/// A persistent context that hands out [`FakePage`]s.
pub struct FakeContext {
    closed: AtomicBool,
    pages_created: AtomicUsize,
    get_responses: Mutex<HashMap<String, Vec<u8>>>,
    default_eval_delay: Mutex<Duration>,
}

impl FakeContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            pages_created: AtomicUsize::new(0),
            get_responses: Mutex::new(HashMap::new()),
            default_eval_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn pages_created(&self) -> usize {
        self.pages_created.load(Ordering::SeqCst)
    }

    pub fn set_get_response(&self, url: &str, body: Vec<u8>) {
        self.get_responses
            .lock()
            .unwrap()
            .insert(url.to_string(), body);
    }

    /// Every page subsequently created via `new_page` starts with this
    /// `evaluate` delay already set, for tests that need to exercise a
    /// page created deep inside a handler rather than constructed directly.
    pub fn set_default_eval_delay(&self, delay: Duration) {
        *self.default_eval_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl BrowserContext for FakeContext {
    async fn new_page(&self) -> EngineResult<Box<dyn PageHandle>> {
        self.pages_created.fetch_add(1, Ordering::SeqCst);
        let page = FakePage::new();
        let delay = *self.default_eval_delay.lock().unwrap();
        if delay > Duration::ZERO {
            page.set_eval_delay(delay);
        }
        Ok(Box::new(page))
    }

    async fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request_get(&self, url: &str, _timeout: Duration) -> EngineResult<Vec<u8>> {
        self.get_responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::Other(format!("no fake response registered for {url}")))
    }
}
