//! The error taxonomy shared by every `tabd-*` crate.
//!
//! Components never know about HTTP; they return `CoreError`, and only the
//! `tabd-api` boundary maps variants to a status code and a JSON body. This
//! keeps the "kind" discrimination in one sum type instead of scattered
//! `err.status_code` checks.

use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input: missing `userId`, non-http(s) URL, oversized expression, ...
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid API/admin key.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unknown tab/download for this user, or no registry entry on disk.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation conflicts with the resource's current state
    /// (e.g. requesting content of a non-completed download).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A fixed-window or quota limiter denied the request.
    #[error("rate limited, retry after {retry_after:?}: {message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
    },

    /// A deadline-bounded wait fired before the operation completed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The per-user concurrency queue overflowed its hard wait deadline.
    #[error("user concurrency limit exceeded: {0}")]
    ConcurrencyBusy(String),

    /// Unexpected failure from the browser engine.
    #[error("engine error: {0}")]
    EngineError(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::EngineError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn concurrency_busy(msg: impl Into<String>) -> Self {
        Self::ConcurrencyBusy(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after,
        }
    }

    /// Whether a caller could reasonably retry this exact request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_) | CoreError::ConcurrencyBusy(_) | CoreError::RateLimited { .. }
        )
    }
}
