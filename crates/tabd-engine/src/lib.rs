//! # Tabd Engine
//!
//! The browser-engine abstraction the orchestrator drives: trait-only
//! definitions with NO concrete CDP types here, matching the split used
//! upstream between a pure abstraction layer and its concrete drivers.
//!
//! `tabd-core` depends only on [`BrowserContext`] / [`PageHandle`] /
//! [`ElementLocator`], never on a specific driver, so the orchestrator's
//! contracts can be exercised against [`fake::FakeContext`] in tests and
//! against the real [`cdp::CdpContext`] in production.

pub mod error;
pub mod fake;
pub mod params;
pub mod traits;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use error::{EngineError, EngineResult};
pub use params::{BoundingBox, ClickOptions, Cookie, LoadState, NavigateParams, ScreenshotParams};
pub use traits::{BrowserContext, DownloadEvent, DownloadHandle, ElementLocator, PageHandle};
