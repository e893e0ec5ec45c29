//! Shared parsing/lookup helpers every handler leans on: turning a raw
//! `userId`/`tabId` string into the typed id, then resolving the tab through
//! the one path (`SessionRegistry::find_tab_by_id`) that enforces tenant
//! isolation.

use std::sync::Arc;

use tabd_core::sessions::Tab;
use tabd_types::{CoreError, TabId, UserId};

use crate::error::{into_api_error, ApiError};
use crate::state::AppState;

pub fn parse_user_id(raw: &str, state: &AppState) -> Result<UserId, ApiError> {
    UserId::new(raw).map_err(|e| into_api_error(e, state))
}

pub fn require_tab(state: &AppState, tab_id: &TabId, user_id: &UserId) -> Result<Arc<Tab>, ApiError> {
    state
        .core
        .sessions
        .find_tab_by_id(tab_id, user_id)
        .ok_or_else(|| into_api_error(CoreError::not_found(format!("tab {tab_id} not found")), state))
}
