//! Process-wide configuration, read once from the environment at startup.
//!
//! Follows the teacher's `env::var(...).ok().and_then(|s| s.parse().ok()).unwrap_or(default)`
//! pattern throughout: an unset or invalid numeric/bool var silently falls
//! back to its default. The exceptions are the bind port and the on-disk
//! directories, which fail fast on startup rather than silently mis-binding
//! or writing into the wrong place.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tabd_types::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessMode {
    True,
    False,
    Virtual,
}

impl HeadlessMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "true" => Some(Self::True),
            "false" => Some(Self::False),
            "virtual" => Some(Self::Virtual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEnv {
    Development,
    Production,
}

impl NodeEnv {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "development" => Some(Self::Development),
            "production" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Every tunable the orchestrator needs, populated once from the process
/// environment. Never mutated after startup; cheap to clone (paths and a
/// handful of scalars).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub node_env: NodeEnv,

    pub admin_key: Option<String>,
    pub api_key: Option<String>,

    pub profiles_dir: PathBuf,
    pub downloads_dir: PathBuf,

    pub download_ttl: Duration,
    pub max_download_size_mb: u64,
    pub max_blob_size_mb: u64,
    pub max_downloads_per_user: usize,

    pub request_timeout: Duration,
    pub max_concurrency_per_user: usize,
    pub max_sessions: usize,
    pub idle_session_timeout: Duration,

    pub snapshot_max_chars: usize,
    pub snapshot_tail_chars: usize,
    pub build_refs_timeout: Duration,
    pub tab_lock_timeout: Duration,

    pub health_probe_interval: Duration,
    pub consecutive_failure_threshold: u32,

    pub headless: HeadlessMode,
    pub proxy: Option<ProxyConfig>,

    pub batch_concurrency: usize,
    pub max_batch_files: usize,
    pub rate_limit_eval_extended_max: u32,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parsed(key, default_secs))
}

impl AppConfig {
    /// Load configuration from the process environment, failing fast on
    /// structurally invalid values that would otherwise bind to the wrong
    /// port or write into the wrong directory.
    pub fn from_env() -> CoreResult<Self> {
        let port: u16 = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| CoreError::validation(format!("invalid PORT: {raw:?}")))?,
            Err(_) => 8080,
        };
        let bind_host = std::env::var("BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let bind_addr: SocketAddr = format!("{bind_host}:{port}")
            .parse()
            .map_err(|_| CoreError::validation(format!("invalid bind address {bind_host}:{port}")))?;

        let profiles_dir = PathBuf::from(
            std::env::var("PROFILES_DIR").unwrap_or_else(|_| "./data/profiles".to_string()),
        );
        let downloads_dir = PathBuf::from(
            std::env::var("DOWNLOADS_DIR").unwrap_or_else(|_| "./data/downloads".to_string()),
        );
        for dir in [&profiles_dir, &downloads_dir] {
            if dir.exists() && !dir.is_dir() {
                return Err(CoreError::validation(format!(
                    "{} exists and is not a directory",
                    dir.display()
                )));
            }
        }

        let node_env = std::env::var("NODE_ENV")
            .ok()
            .and_then(|s| NodeEnv::parse(&s))
            .unwrap_or(NodeEnv::Development);

        let headless = std::env::var("HEADLESS")
            .ok()
            .and_then(|s| HeadlessMode::parse(&s))
            .unwrap_or(HeadlessMode::True);

        let proxy = std::env::var("PROXY_HOST").ok().map(|host| ProxyConfig {
            host,
            port: env_parsed("PROXY_PORT", 8080u16),
            username: std::env::var("PROXY_USERNAME").ok(),
            password: std::env::var("PROXY_PASSWORD").ok(),
        });

        Ok(Self {
            bind_addr,
            log_filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            node_env,

            admin_key: std::env::var("ADMIN_KEY").ok(),
            api_key: std::env::var("API_KEY").ok(),

            profiles_dir,
            downloads_dir,

            download_ttl: env_secs("DOWNLOAD_TTL_SECS", 24 * 60 * 60),
            max_download_size_mb: env_parsed("MAX_DOWNLOAD_SIZE_MB", 500u64),
            max_blob_size_mb: env_parsed("MAX_BLOB_SIZE_MB", 50u64),
            max_downloads_per_user: env_parsed("MAX_DOWNLOADS_PER_USER", 500usize),

            request_timeout: env_secs("REQUEST_TIMEOUT_SECS", 30),
            max_concurrency_per_user: env_parsed("MAX_CONCURRENCY_PER_USER", 3usize),
            max_sessions: env_parsed("MAX_SESSIONS", 200usize),
            idle_session_timeout: env_secs("IDLE_SESSION_TIMEOUT_SECS", 30 * 60),

            snapshot_max_chars: env_parsed("SNAPSHOT_MAX_CHARS", 80_000usize),
            snapshot_tail_chars: env_parsed("SNAPSHOT_TAIL_CHARS", 5_000usize),
            build_refs_timeout: env_secs("BUILD_REFS_TIMEOUT_SECS", 12),
            tab_lock_timeout: env_secs("TAB_LOCK_TIMEOUT_SECS", 30),

            health_probe_interval: env_secs("HEALTH_PROBE_INTERVAL_SECS", 60),
            consecutive_failure_threshold: env_parsed("CONSECUTIVE_FAILURE_THRESHOLD", 3u32),

            headless,
            proxy,

            batch_concurrency: env_parsed("BATCH_CONCURRENCY", 5usize),
            max_batch_files: env_parsed("MAX_BATCH_FILES", 50usize),
            rate_limit_eval_extended_max: env_parsed("RATE_LIMIT_EVAL_EXTENDED_MAX", 20u32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env::set_var mutates global process state; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("PORT");
        std::env::remove_var("NODE_ENV");
        std::env::remove_var("MAX_CONCURRENCY_PER_USER");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.node_env, NodeEnv::Development);
        assert_eq!(config.max_concurrency_per_user, 3);
    }

    #[test]
    fn invalid_integer_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MAX_CONCURRENCY_PER_USER", "not-a-number");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.max_concurrency_per_user, 3);
        std::env::remove_var("MAX_CONCURRENCY_PER_USER");
    }

    #[test]
    fn invalid_port_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PORT", "not-a-port");
        let result = AppConfig::from_env();
        std::env::remove_var("PORT");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_profiles_dir_that_is_a_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var("PROFILES_DIR", file.path());
        let result = AppConfig::from_env();
        std::env::remove_var("PROFILES_DIR");
        assert!(result.is_err());
    }
}
