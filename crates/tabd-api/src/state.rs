//! Shared application state handed to every handler via axum's `State`.

use std::sync::Arc;

use tabd_core::Core;
use tokio::sync::Notify;

use crate::auth::AuthConfig;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
    pub auth: Arc<AuthConfig>,
    /// Signalled by the admin stop endpoint to trigger graceful shutdown
    /// from inside a request handler rather than only from OS signals.
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(core: Arc<Core>, auth: AuthConfig) -> Self {
        Self {
            core,
            auth: Arc::new(auth),
            shutdown: Arc::new(Notify::new()),
        }
    }
}
