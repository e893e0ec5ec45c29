//! Parameter and result types shared by every `PageHandle` implementation.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Load,
    DomContentLoaded,
    NetworkIdle,
}

#[derive(Debug, Clone)]
pub struct NavigateParams {
    pub wait_until: LoadState,
    pub timeout: Duration,
}

impl Default for NavigateParams {
    fn default() -> Self {
        Self {
            wait_until: LoadState::DomContentLoaded,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenshotParams {
    pub full_page: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Escalation ladder for `click`: plain click, then a forced click, then a
/// synthetic mouse sequence. `ElementLocator::click` is called once per
/// rung by the action layer, which decides whether to escalate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClickOptions {
    pub force: bool,
}

/// A single browser cookie, read from and written to `document.cookie`.
/// `domain`/`path`/`expires` are best-effort: `document.cookie` round-trips
/// don't expose a cookie's domain, so reads always report `None` there.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}
