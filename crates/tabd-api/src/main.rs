use std::future::pending;
use std::sync::Arc;

use clap::Parser;
use tabd_api::auth::AuthConfig;
use tabd_api::{build_router, AppState};
use tabd_core::pool::ContextLauncher;
use tabd_core::{AppConfig, Core};
#[cfg(not(feature = "cdp"))]
use tabd_engine::fake::FakeContext;
use tabd_engine::traits::BrowserContext;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tabd-api")]
#[command(about = "Multi-tenant headless browser control plane")]
struct Args {
    /// Overrides the PORT/BIND_HOST environment variables when set.
    #[arg(long)]
    bind: Option<String>,
}

/// Dev-mode launcher used whenever the `cdp` feature is off: backs every
/// context with the same in-memory double the test suite uses, so the
/// server is runnable (if not useful against real pages) without a Chrome
/// binary on the box.
#[cfg(not(feature = "cdp"))]
struct DevLauncher;

#[cfg(not(feature = "cdp"))]
#[async_trait::async_trait]
impl ContextLauncher for DevLauncher {
    async fn launch(
        &self,
        _profile_dir: &std::path::Path,
        _seed: &tabd_core::pool::SeedOptions,
    ) -> tabd_engine::error::EngineResult<Arc<dyn BrowserContext>> {
        Ok(FakeContext::new())
    }
}

#[cfg(feature = "cdp")]
fn engine_headless_mode(mode: tabd_core::HeadlessMode) -> tabd_engine::cdp::HeadlessMode {
    match mode {
        tabd_core::HeadlessMode::True => tabd_engine::cdp::HeadlessMode::True,
        tabd_core::HeadlessMode::False => tabd_engine::cdp::HeadlessMode::False,
        tabd_core::HeadlessMode::Virtual => tabd_engine::cdp::HeadlessMode::Virtual,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Some(bind) = args.bind {
        config.bind_addr = bind
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --bind address {bind:?}"))?;
    }

    if !config.node_env.is_production() {
        tracing::warn!("NODE_ENV is not production; engine error detail will be echoed to clients");
    }

    let auth = AuthConfig::new(config.api_key.clone(), config.admin_key.clone());
    auth.log_startup_warnings();

    #[cfg(feature = "cdp")]
    let launcher: Arc<dyn ContextLauncher> = Arc::new(tabd_core::pool::CdpLauncher {
        headless: engine_headless_mode(config.headless),
    });
    #[cfg(not(feature = "cdp"))]
    let launcher: Arc<dyn ContextLauncher> = Arc::new(DevLauncher);

    let bind_addr = config.bind_addr;
    let core = Arc::new(Core::new(config, launcher));
    core.reconcile_downloads().await?;
    core.spawn_background_tasks();

    let state = AppState::new(core.clone(), auth);
    let shutdown_notified = state.shutdown.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(bind_address = %bind_addr, version = env!("CARGO_PKG_VERSION"), "tabd-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_notified))
        .await?;

    core.shutdown().await;
    tracing::info!("tabd-api shutdown complete");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM, or the admin `/admin/stop` route notifying
/// `state.shutdown`, whichever comes first.
async fn shutdown_signal(admin_stop: Arc<tokio::sync::Notify>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut handler) => {
                handler.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        _ = admin_stop.notified() => tracing::info!("admin stop requested, shutting down"),
    }
}
