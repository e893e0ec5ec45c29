//! Core trait definitions for the browser abstraction.
//!
//! This module contains ONLY trait definitions with no concrete CDP types;
//! concrete implementations live in `fake` (for tests) and `cdp` (behind the
//! `cdp` feature, for production).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::EngineResult;
use crate::params::{BoundingBox, ClickOptions, Cookie, LoadState, NavigateParams, ScreenshotParams};

/// A persistent browser context rooted at one profile directory.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    /// Open a new page/tab, starting at `about:blank`.
    async fn new_page(&self) -> EngineResult<Box<dyn PageHandle>>;

    /// Close the context and every page within it.
    async fn close(&self) -> EngineResult<()>;

    /// Whether the context has already been closed, externally or by us.
    async fn is_closed(&self) -> bool;

    /// Perform an HTTP GET through the context's own request pipeline
    /// (shares cookies/auth with the context), used by the batch downloader
    /// for `http(s)` candidates.
    async fn request_get(&self, url: &str, timeout: Duration) -> EngineResult<Vec<u8>>;
}

/// A single tab within a [`BrowserContext`].
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str, params: NavigateParams) -> EngineResult<()>;
    async fn current_url(&self) -> EngineResult<String>;
    async fn title(&self) -> EngineResult<String>;
    async fn reload(&self) -> EngineResult<()>;
    async fn go_back(&self) -> EngineResult<()>;
    async fn go_forward(&self) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
    async fn is_closed(&self) -> bool;

    /// Evaluate arbitrary JS, returning its JSON-serialized result.
    async fn evaluate(&self, expression: &str) -> EngineResult<Value>;

    async fn screenshot(&self, params: ScreenshotParams) -> EngineResult<Vec<u8>>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> EngineResult<()>;
    async fn wait_for_timeout(&self, duration: Duration);

    /// Request an aria-tree snapshot of the body subtree. Implementations
    /// must honor the timeout and never panic on a hung accessibility tree.
    async fn aria_snapshot(&self, timeout: Duration) -> EngineResult<String>;

    async fn keyboard_press(&self, key: &str) -> EngineResult<()>;
    async fn mouse_move(&self, x: f64, y: f64) -> EngineResult<()>;
    async fn mouse_down(&self) -> EngineResult<()>;
    async fn mouse_up(&self) -> EngineResult<()>;
    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> EngineResult<()>;

    /// Build a locator for the `nth` (0-based) element matching `(role, name)`.
    async fn locator_by_role(
        &self,
        role: &str,
        name: &str,
        nth: usize,
    ) -> EngineResult<Box<dyn ElementLocator>>;

    /// Build a locator from a raw CSS selector, used by consent-dismissal
    /// and lazy-load scrolling which address elements without going through
    /// the ref table.
    async fn locator_by_selector(&self, selector: &str) -> EngineResult<Box<dyn ElementLocator>>;

    /// Subscribe to this page's download events. Each event carries the
    /// handle used to `save_as` or read `failure()`.
    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent>;

    /// Read `document.cookie` for the page's current origin.
    async fn get_cookies(&self) -> EngineResult<Vec<Cookie>>;

    /// Write each cookie via `document.cookie = "...`, one statement per
    /// cookie so a single malformed entry doesn't block the rest.
    async fn set_cookies(&self, cookies: &[Cookie]) -> EngineResult<()>;
}

/// A resolved element, analogous to Playwright's `Locator`.
#[async_trait]
pub trait ElementLocator: Send + Sync {
    async fn click(&self, opts: ClickOptions) -> EngineResult<()>;
    async fn fill(&self, text: &str, clear_first: bool) -> EngineResult<()>;
    async fn hover(&self) -> EngineResult<()>;
    async fn scroll_into_view_if_needed(&self) -> EngineResult<()>;
    async fn bounding_box(&self) -> EngineResult<Option<BoundingBox>>;
    async fn evaluate(&self, expression: &str) -> EngineResult<Value>;
    async fn is_visible(&self) -> EngineResult<bool>;
}

/// A download started on a page. Mirrors Playwright's `download` event:
/// `suggestedFilename()`, `url()`, `saveAs(path)`, `failure()`.
#[derive(Clone)]
pub struct DownloadEvent {
    pub suggested_filename: String,
    pub url: String,
    pub handle: std::sync::Arc<dyn DownloadHandle>,
}

#[async_trait]
pub trait DownloadHandle: Send + Sync {
    async fn save_as(&self, path: &Path) -> EngineResult<()>;

    /// `Some(reason)` if the download failed or was canceled, `None` on
    /// success.
    async fn failure(&self) -> Option<String>;
}
