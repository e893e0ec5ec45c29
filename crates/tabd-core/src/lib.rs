//! # Tabd Core
//!
//! The orchestrator: everything that mediates between the HTTP surface and
//! the browser engine lives here as an owned [`Core`] struct rather than as
//! process-global statics, so tests can build as many independent instances
//! as they like and the shutdown path has one thing to drain.

pub mod actions;
pub mod config;
pub mod downloads;
pub mod extraction;
pub mod health;
pub mod pool;
pub mod ratelimit;
pub mod sessions;

use std::sync::Arc;

use tracing::{info, warn};

pub use config::{AppConfig, HeadlessMode, NodeEnv, ProxyConfig};

use actions::{ActionsConfig, ActionsEngine};
use downloads::{DownloadRegistry, DownloadRegistryConfig};
use health::HealthTracker;
use pool::{ContextLauncher, ContextPool};
use ratelimit::RateLimiter;
use sessions::{ConcurrencyLimiter, SessionRegistry};

/// Every long-lived subsystem the HTTP handlers drive, wired together once
/// at startup. Cheap to pass around as `Arc<Core>`.
pub struct Core {
    pub config: AppConfig,
    pub pool: Arc<ContextPool>,
    pub sessions: Arc<SessionRegistry>,
    pub concurrency: Arc<ConcurrencyLimiter>,
    pub actions: Arc<ActionsEngine>,
    pub downloads: Arc<DownloadRegistry>,
    pub ratelimit: Arc<RateLimiter>,
    pub health: Arc<HealthTracker>,
}

impl Core {
    /// Wire every subsystem from `config`, using `launcher` to produce real
    /// (or fake, in tests) browser contexts. Does not spawn background
    /// tasks or touch disk beyond what `DownloadRegistry::reconcile_on_startup`
    /// does when the caller invokes it.
    pub fn new(config: AppConfig, launcher: Arc<dyn ContextLauncher>) -> Self {
        let pool = Arc::new(ContextPool::new(
            config.profiles_dir.clone(),
            config.max_sessions,
            launcher,
        ));
        let sessions = Arc::new(SessionRegistry::new(
            pool.clone(),
            config.max_sessions,
            config.idle_session_timeout,
        ));
        let sessions_for_hook = sessions.clone();
        pool.on_evict(Box::new(move |user_id| {
            sessions_for_hook.handle_pool_eviction(user_id);
        }));

        let actions = Arc::new(ActionsEngine::new(ActionsConfig {
            max_snapshot_chars: config.snapshot_max_chars,
            snapshot_tail_chars: config.snapshot_tail_chars,
        }));

        let downloads = Arc::new(DownloadRegistry::new(DownloadRegistryConfig {
            downloads_dir: config.downloads_dir.clone(),
            max_per_user: config.max_downloads_per_user,
            max_size_mb: config.max_download_size_mb,
            ttl: config.download_ttl,
        }));

        // Every new tab forwards its browser-level download events into the
        // registry: a download always goes through `start_download` ->
        // `finalize_download`, regardless of which tab or user triggered it.
        let downloads_for_hook = downloads.clone();
        sessions.on_tab_created(Box::new(move |tab| {
            let downloads = downloads_for_hook.clone();
            let mut events = tab.page.subscribe_downloads();
            let user_id = tab.user_id.clone();
            let tab_id = tab.tab_id;
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            match downloads
                                .start_download(&user_id, tab_id, &event.url, &event.suggested_filename)
                                .await
                            {
                                Ok(info) => downloads.finalize_download(&info.id, event.handle.as_ref()).await,
                                Err(e) => warn!(error = %e, "failed to register incoming download"),
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            });
        }));

        let concurrency = Arc::new(ConcurrencyLimiter::new(config.max_concurrency_per_user));
        let ratelimit = Arc::new(RateLimiter::new());
        let health = Arc::new(HealthTracker::new(config.consecutive_failure_threshold));

        Self {
            config,
            pool,
            sessions,
            concurrency,
            actions,
            downloads,
            ratelimit,
            health,
        }
    }

    /// Reconcile the download registry against disk. Must run before any
    /// handler touches `downloads`.
    pub async fn reconcile_downloads(&self) -> tabd_types::CoreResult<()> {
        self.downloads.reconcile_on_startup().await
    }

    /// Spawn the background sweep tasks (rate-limit window sweep, idle
    /// session reaper, download TTL sweep + debounced save loop, health
    /// probe). Each runs as its own detached task, so one panicking never
    /// takes another down with it; intended to be called once from `main`.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let core = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                core.ratelimit.sweep();
            }
        });

        let core = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                core.sessions.reap_idle().await;
            }
        });

        let core = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                core.downloads.ttl_sweep().await;
            }
        });

        let downloads = self.downloads.clone();
        tokio::spawn(downloads.run_save_loop());

        let core = self.clone();
        let probe_interval = self.config.health_probe_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(probe_interval);
            loop {
                interval.tick().await;
                core.health.probe();
            }
        });

        info!("background sweep tasks spawned");
    }

    /// Best-effort graceful shutdown: stop accepting new work (the caller
    /// must do that at the HTTP layer), flag recovering, close every browser
    /// context, and flush the download registry to disk exactly once.
    pub async fn shutdown(&self) {
        self.health.set_recovering(true);
        self.sessions.close_all_sessions().await;
        self.downloads.flush().await;
        info!("core shutdown complete");
    }
}
