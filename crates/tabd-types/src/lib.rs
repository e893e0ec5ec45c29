//! # Tabd Types
//!
//! Shared data types for the tab orchestrator: the user/session/tab identifiers,
//! the accessibility ref model, download bookkeeping, and the error taxonomy that
//! every other `tabd-*` crate returns.
//!
//! Kept as its own crate so that `tabd-core`, `tabd-engine`, and `tabd-api` can all
//! depend on the same vocabulary without a circular dependency back through the
//! orchestrator itself.

pub mod download;
pub mod error;
pub mod ids;
pub mod refs;

pub use download::{DownloadInfo, DownloadStatus};
pub use error::{CoreError, CoreResult};
pub use ids::{SessionKey, TabId, UserId};
pub use refs::{RefId, RefInfo, RefTable};
