//! Page-readiness wait and best-effort consent-dialog dismissal, run once
//! before every snapshot.

use std::time::Duration;

use tabd_engine::params::{ClickOptions, LoadState, NavigateParams};
use tabd_engine::traits::PageHandle;

const HYDRATION_MAX_ITERATIONS: u32 = 40;
const HYDRATION_POLL_INTERVAL: Duration = Duration::from_millis(250);
const HYDRATION_QUIET_WINDOW: Duration = Duration::from_millis(400);

/// Selectors tried, in order, for a best-effort consent dismissal. Each
/// attempt gets a 100ms visibility probe and a 1s click timeout; failures
/// are swallowed silently — a blocked cookie banner should never fail a
/// snapshot request.
const CONSENT_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "#onetrust-reject-all-handler",
    ".onetrust-close-btn-handler",
    "[aria-label=\"Accept all\"]",
    "[aria-label=\"Close\"]",
    "[aria-label=\"Dismiss\"]",
    "[role=\"dialog\"] button",
    "[class*=\"consent\"] button",
    "[class*=\"privacy\"] button",
    "[class*=\"cookie\"] button",
    "[class*=\"modal\"] button[class*=\"close\"]",
    "[class*=\"overlay\"] button[class*=\"close\"]",
];

const CONSENT_BUTTON_TEXT_RE: &str = r"(?i)^(Close|Accept|I Accept|Got it|OK)$";

/// Wait for the page to settle before building refs: DOM-content-loaded,
/// an optional short network-idle wait, then a bounded hydration loop
/// checking `document.readyState` and resource-timing quiescence, then two
/// animation frames. Every wait is best-effort — a failure here is logged
/// upstream but never aborts the snapshot.
pub async fn wait_for_page_ready(page: &dyn PageHandle) {
    let _ = page
        .wait_for_load_state(LoadState::DomContentLoaded, Duration::from_secs(10))
        .await;
    let _ = page
        .wait_for_load_state(LoadState::NetworkIdle, Duration::from_secs(2))
        .await;

    for _ in 0..HYDRATION_MAX_ITERATIONS {
        let quiescent = check_hydration_quiescent(page).await;
        if quiescent {
            break;
        }
        page.wait_for_timeout(HYDRATION_POLL_INTERVAL).await;
    }

    // Two animation frames, approximated with the engine's own timer since
    // `requestAnimationFrame` round trips aren't observable across the CDP
    // boundary without a dedicated event.
    page.wait_for_timeout(Duration::from_millis(16)).await;
    page.wait_for_timeout(Duration::from_millis(16)).await;
}

async fn check_hydration_quiescent(page: &dyn PageHandle) -> bool {
    let script = format!(
        "(() => {{ \
            if (document.readyState !== 'complete') return false; \
            const entries = performance.getEntriesByType('resource'); \
            if (entries.length === 0) return true; \
            const last = entries[entries.length - 1]; \
            const sinceLast = performance.now() - (last.responseEnd || 0); \
            return sinceLast >= {quiet_ms}; \
        }})()",
        quiet_ms = HYDRATION_QUIET_WINDOW.as_millis()
    );
    match page.evaluate(&script).await {
        Ok(value) => value.as_bool().unwrap_or(false),
        Err(_) => false,
    }
}

/// Best-effort: try each selector in turn, clicking the first visible match.
/// Never propagates an error — a consent dialog that can't be dismissed is
/// not a reason to fail the caller's snapshot request.
pub async fn dismiss_consent(page: &dyn PageHandle) {
    for selector in CONSENT_SELECTORS {
        if try_dismiss_selector(page, selector).await {
            return;
        }
    }
}

async fn try_dismiss_selector(page: &dyn PageHandle, selector: &str) -> bool {
    let Ok(locator) = page.locator_by_selector(selector).await else {
        return false;
    };

    let visible = tokio::time::timeout(Duration::from_millis(100), locator.is_visible())
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(false);
    if !visible {
        return false;
    }

    if selector.contains("button") && !matches_consent_button_text(page, selector).await {
        return false;
    }

    tokio::time::timeout(Duration::from_secs(1), locator.click(ClickOptions::default()))
        .await
        .ok()
        .and_then(|r| r.ok())
        .is_some()
}

async fn matches_consent_button_text(page: &dyn PageHandle, selector: &str) -> bool {
    let script = format!(
        "(() => {{ const el = document.querySelector({selector:?}); \
        return el ? el.innerText || '' : ''; }})()"
    );
    let Ok(value) = page.evaluate(&script).await else {
        return true; // can't confirm text; fall through to the click attempt
    };
    let Some(text) = value.as_str() else {
        return true;
    };
    regex::Regex::new(CONSENT_BUTTON_TEXT_RE)
        .map(|re| re.is_match(text.trim()))
        .unwrap_or(true)
}

/// Construct the default navigation parameters used by the `navigate`
/// action: wait for DOM-content-loaded within the caller-supplied timeout.
pub fn navigate_params(timeout: Duration) -> NavigateParams {
    NavigateParams {
        wait_until: LoadState::DomContentLoaded,
        timeout,
    }
}
