//! Error type for the browser-engine abstraction.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch context: {0}")]
    Launch(String),
    #[error("failed to create page: {0}")]
    PageCreation(String),
    #[error("failed to navigate: {0}")]
    Navigation(String),
    #[error("failed to evaluate script: {0}")]
    Evaluation(String),
    #[error("failed to take screenshot: {0}")]
    Screenshot(String),
    #[error("failed to close page: {0}")]
    PageClose(String),
    #[error("failed to close context: {0}")]
    ContextClose(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Heuristic used by the click escalation ladder: did the browser refuse
    /// the click because another element intercepted the pointer event?
    pub fn mentions_pointer_interception(&self) -> bool {
        self.to_string().to_lowercase().contains("intercept")
    }
}
