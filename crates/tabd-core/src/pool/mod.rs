//! Bounded LRU of persistent browser contexts, keyed by user.
//!
//! Launching a context is expensive, so concurrent `ensure_context` callers
//! for the same user must share one launch instead of racing to create
//! duplicates ("single-flight"). Rather than threading a `Shared` future
//! through every caller, each user gets a dedicated async mutex: the first
//! caller through holds it while it launches and populates the entry; every
//! other caller blocks on the same mutex and, once unblocked, finds the
//! entry already there and returns it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tabd_engine::error::EngineResult;
use tabd_engine::traits::BrowserContext;
use tabd_types::{CoreError, CoreResult, UserId};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Locale/timezone/geolocation/viewport seed honored on first launch only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedOptions {
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub geolocation: Option<(f64, f64)>,
    pub viewport: Option<(u32, u32)>,
}

/// Launches a persistent [`BrowserContext`] rooted at a profile directory.
///
/// Kept as a trait (rather than a free function) so tests can substitute an
/// in-memory launcher backed by `tabd_engine::fake::FakeContext` without the
/// `cdp` feature.
#[async_trait]
pub trait ContextLauncher: Send + Sync {
    async fn launch(
        &self,
        profile_dir: &std::path::Path,
        seed: &SeedOptions,
    ) -> EngineResult<Arc<dyn BrowserContext>>;
}

struct ContextEntry {
    context: Arc<dyn BrowserContext>,
    #[allow(dead_code)]
    profile_dir: PathBuf,
    last_access: Instant,
    seed_options: SeedOptions,
}

/// Eviction callback, invoked with the evicted user's id before the context
/// is closed, so subscribers (`SessionRegistry`, `DownloadRegistry`) can drop
/// references first.
pub type EvictionHook = Box<dyn Fn(&UserId) + Send + Sync>;

pub struct ContextPool {
    max_size: usize,
    profiles_dir: PathBuf,
    launcher: Arc<dyn ContextLauncher>,
    entries: DashMap<UserId, ContextEntry>,
    launch_locks: DashMap<UserId, Arc<Mutex<()>>>,
    eviction_hooks: std::sync::Mutex<Vec<EvictionHook>>,
}

impl ContextPool {
    pub fn new(profiles_dir: PathBuf, max_size: usize, launcher: Arc<dyn ContextLauncher>) -> Self {
        Self {
            max_size,
            profiles_dir,
            launcher,
            entries: DashMap::new(),
            launch_locks: DashMap::new(),
            eviction_hooks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn on_evict(&self, hook: EvictionHook) {
        self.eviction_hooks.lock().unwrap().push(hook);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_user_ids(&self) -> Vec<UserId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn ensure_context(
        &self,
        user_id: &UserId,
        seed: Option<SeedOptions>,
    ) -> CoreResult<Arc<dyn BrowserContext>> {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            if !entry.context.is_closed().await {
                entry.last_access = Instant::now();
                if let Some(requested) = &seed {
                    if *requested != entry.seed_options {
                        warn!(
                            user_id = %user_id,
                            "ignoring seed options for an already-launched context; persistence wins over fresh configuration"
                        );
                    }
                }
                return Ok(entry.context.clone());
            }
        }
        // Entry missing or externally closed: fall through and (re)launch.
        self.entries.remove(user_id);
        self.launch(user_id, seed.unwrap_or_default()).await
    }

    async fn launch(
        &self,
        user_id: &UserId,
        seed: SeedOptions,
    ) -> CoreResult<Arc<dyn BrowserContext>> {
        let lock = self
            .launch_locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished launching while we waited.
        if let Some(entry) = self.entries.get(user_id) {
            return Ok(entry.context.clone());
        }

        let profile_dir = self.profiles_dir.join(user_id.urlencoded());
        let context = self
            .launcher
            .launch(&profile_dir, &seed)
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;

        self.entries.insert(
            user_id.clone(),
            ContextEntry {
                context: context.clone(),
                profile_dir,
                last_access: Instant::now(),
                seed_options: seed,
            },
        );
        self.launch_locks.remove(user_id);

        self.evict_if_over_capacity(user_id).await;

        Ok(context)
    }

    /// Evict the least-recently-used entry other than `just_inserted` if the
    /// pool is now over capacity. Runs eviction hooks before closing.
    async fn evict_if_over_capacity(&self, just_inserted: &UserId) {
        if self.entries.len() <= self.max_size {
            return;
        }
        let victim = self
            .entries
            .iter()
            .filter(|e| e.key() != just_inserted)
            .min_by_key(|e| e.value().last_access)
            .map(|e| e.key().clone());

        let Some(victim) = victim else { return };
        info!(user_id = %victim, "evicting least-recently-used browser context");
        self.run_eviction_hooks(&victim);
        if let Some((_, entry)) = self.entries.remove(&victim) {
            if let Err(e) = entry.context.close().await {
                warn!(user_id = %victim, error = %e, "error closing evicted context");
            }
        }
    }

    fn run_eviction_hooks(&self, user_id: &UserId) {
        for hook in self.eviction_hooks.lock().unwrap().iter() {
            hook(user_id);
        }
    }

    /// Await any pending launch, close the existing context, then relaunch.
    /// Used when a display-mode toggle requires a fresh context.
    pub async fn restart_context(&self, user_id: &UserId) -> CoreResult<Arc<dyn BrowserContext>> {
        self.await_pending_launch(user_id).await;
        if let Some((_, entry)) = self.entries.remove(user_id) {
            let _ = entry.context.close().await;
        }
        self.ensure_context(user_id, None).await
    }

    pub async fn close_context(&self, user_id: &UserId) {
        self.await_pending_launch(user_id).await;
        if let Some((_, entry)) = self.entries.remove(user_id) {
            self.run_eviction_hooks(user_id);
            if let Err(e) = entry.context.close().await {
                warn!(user_id = %user_id, error = %e, "error closing context");
            }
        }
    }

    pub async fn close_all(&self) {
        let user_ids: Vec<UserId> = self.entries.iter().map(|e| e.key().clone()).collect();
        for user_id in user_ids {
            self.close_context(&user_id).await;
        }
    }

    async fn await_pending_launch(&self, user_id: &UserId) {
        if let Some(lock) = self.launch_locks.get(user_id).map(|l| l.clone()) {
            let _guard = lock.lock().await;
        }
    }
}

/// Snapshot of pool occupancy, consumed by the health endpoint.
pub struct PoolStats {
    pub pool_size: usize,
    pub active_user_ids: Vec<UserId>,
    pub profile_dirs_total: usize,
}

impl ContextPool {
    pub fn stats(&self) -> PoolStats {
        let active_user_ids = self.active_user_ids();
        PoolStats {
            pool_size: self.entries.len(),
            profile_dirs_total: active_user_ids.len(),
            active_user_ids,
        }
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<ContextPool>();
}

/// Production [`ContextLauncher`], launching a real `spider_chrome`-backed
/// context per profile directory.
///
/// Known gap: `SeedOptions` (locale/timezone/geolocation/viewport) isn't
/// threaded into `launch_persistent_context` yet, so a first-launch seed is
/// currently silently ignored rather than applied. `tabd_engine::cdp`
/// doesn't expose a verified way to set these at launch, and inventing one
/// isn't safe without the real API in front of us.
#[cfg(feature = "cdp")]
pub struct CdpLauncher {
    pub headless: tabd_engine::cdp::HeadlessMode,
}

#[cfg(feature = "cdp")]
#[async_trait]
impl ContextLauncher for CdpLauncher {
    async fn launch(
        &self,
        profile_dir: &std::path::Path,
        _seed: &SeedOptions,
    ) -> EngineResult<Arc<dyn BrowserContext>> {
        let context = tabd_engine::cdp::launch_persistent_context(profile_dir, self.headless).await?;
        Ok(Arc::new(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabd_engine::fake::FakeContext;

    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl ContextLauncher for CountingLauncher {
        async fn launch(
            &self,
            _profile_dir: &Path,
            _seed: &SeedOptions,
        ) -> EngineResult<Arc<dyn BrowserContext>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(FakeContext::new())
        }
    }

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[tokio::test]
    async fn concurrent_ensure_context_single_flights() {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let pool = Arc::new(ContextPool::new(
            PathBuf::from("/tmp/tabd-test-profiles"),
            50,
            launcher.clone(),
        ));
        let user = uid("u1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move { pool.ensure_context(&user, None).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn eviction_runs_hooks_before_close() {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let pool = ContextPool::new(PathBuf::from("/tmp/tabd-test-profiles"), 1, launcher);
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let evicted_clone = evicted.clone();
        pool.on_evict(Box::new(move |user_id| {
            evicted_clone.lock().unwrap().push(user_id.clone());
        }));

        pool.ensure_context(&uid("u1"), None).await.unwrap();
        pool.ensure_context(&uid("u2"), None).await.unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(evicted.lock().unwrap().as_slice(), &[uid("u1")]);
    }

    #[tokio::test]
    async fn reused_context_ignores_new_seed_options() {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let pool = ContextPool::new(PathBuf::from("/tmp/tabd-test-profiles"), 50, launcher);
        let user = uid("u1");

        pool.ensure_context(
            &user,
            Some(SeedOptions {
                locale: Some("en-US".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        // Different seed on a live context: ignored, not an error.
        pool.ensure_context(
            &user,
            Some(SeedOptions {
                locale: Some("fr-FR".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        assert_eq!(pool.len(), 1);
    }
}
