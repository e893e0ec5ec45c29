//! Sessions (per user) → tab groups → tabs, plus the `tabId -> UserId`
//! reverse index that lets `find_tab_by_id` avoid scanning every session.

pub mod concurrency;
pub mod tab_lock;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tabd_engine::traits::{BrowserContext, PageHandle};
use tabd_types::{CoreError, CoreResult, RefTable, TabId, UserId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::pool::{ContextPool, SeedOptions};

pub use concurrency::ConcurrencyLimiter;
pub use tab_lock::TabLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    Created,
    Loaded,
    Ready,
    Acting,
    Closed,
}

pub struct Tab {
    pub tab_id: TabId,
    pub user_id: UserId,
    pub list_item_id: String,
    pub page: Arc<dyn PageHandle>,
    pub refs: AsyncMutex<RefTable>,
    pub visited_urls: AsyncMutex<Vec<String>>,
    pub last_snapshot: AsyncMutex<Option<String>>,
    pub tool_call_count: AtomicU64,
    state: std::sync::Mutex<TabState>,
}

impl Tab {
    #[cfg(test)]
    pub fn new_for_test(page: Arc<dyn PageHandle>) -> Self {
        Self::new(TabId::new(), UserId::new("test").unwrap(), "test".to_string(), page)
    }

    fn new(tab_id: TabId, user_id: UserId, list_item_id: String, page: Arc<dyn PageHandle>) -> Self {
        Self {
            tab_id,
            user_id,
            list_item_id,
            page,
            refs: AsyncMutex::new(RefTable::new()),
            visited_urls: AsyncMutex::new(Vec::new()),
            last_snapshot: AsyncMutex::new(None),
            tool_call_count: AtomicU64::new(0),
            state: std::sync::Mutex::new(TabState::Created),
        }
    }

    pub fn state(&self) -> TabState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TabState) {
        *self.state.lock().unwrap() = state;
    }

    pub async fn record_visit(&self, url: String) {
        self.visited_urls.lock().await.push(url);
    }

    pub fn bump_tool_calls(&self) -> u64 {
        self.tool_call_count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
struct TabGroup {
    tabs: HashMap<TabId, Arc<Tab>>,
}

pub struct Session {
    pub user_id: UserId,
    context: std::sync::Mutex<Arc<dyn BrowserContext>>,
    groups: std::sync::Mutex<HashMap<String, TabGroup>>,
    last_access: std::sync::Mutex<Instant>,
}

impl Session {
    pub fn context(&self) -> Arc<dyn BrowserContext> {
        self.context.lock().unwrap().clone()
    }

    fn set_context(&self, context: Arc<dyn BrowserContext>) {
        *self.context.lock().unwrap() = context;
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }

    pub fn tabs(&self) -> Vec<Arc<Tab>> {
        self.groups
            .lock()
            .unwrap()
            .values()
            .flat_map(|g| g.tabs.values().cloned())
            .collect()
    }

    pub fn tab(&self, tab_id: &TabId) -> Option<Arc<Tab>> {
        self.groups
            .lock()
            .unwrap()
            .values()
            .find_map(|g| g.tabs.get(tab_id).cloned())
    }
}

const DEFAULT_MAX_SESSIONS: usize = 10_000;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SessionRegistry {
    pool: Arc<ContextPool>,
    max_sessions: usize,
    idle_timeout: Duration,
    sessions: DashMap<UserId, Arc<Session>>,
    launching: DashMap<UserId, Arc<AsyncMutex<()>>>,
    reverse_index: DashMap<TabId, UserId>,
    tab_created_hooks: std::sync::Mutex<Vec<Box<dyn Fn(Arc<Tab>) + Send + Sync>>>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<ContextPool>, max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            pool,
            max_sessions: if max_sessions == 0 { DEFAULT_MAX_SESSIONS } else { max_sessions },
            idle_timeout: idle_timeout.max(MIN_IDLE_TIMEOUT),
            sessions: DashMap::new(),
            launching: DashMap::new(),
            reverse_index: DashMap::new(),
            tab_created_hooks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults(pool: Arc<ContextPool>) -> Self {
        Self::new(pool, DEFAULT_MAX_SESSIONS, DEFAULT_IDLE_TIMEOUT)
    }

    /// Removes a session when its underlying context is evicted by the pool.
    /// Registered by the caller via `ContextPool::on_evict`.
    pub fn handle_pool_eviction(&self, user_id: &UserId) {
        if let Some((_, session)) = self.sessions.remove(user_id) {
            for tab in session.tabs() {
                self.reverse_index.remove(&tab.tab_id);
            }
        }
    }

    pub async fn get_session(&self, user_id: &UserId, seed: Option<SeedOptions>) -> CoreResult<Arc<Session>> {
        if let Some(session) = self.sessions.get(user_id) {
            session.touch();
            let context = self.pool.ensure_context(user_id, seed).await?;
            session.set_context(context);
            return Ok(session.clone());
        }

        if self.sessions.len() + self.launching.len() >= self.max_sessions {
            return Err(CoreError::validation("session capacity exceeded"));
        }

        // Single-flight: concurrent callers for a brand-new user share one
        // launch future instead of racing to create duplicate sessions.
        let lock = self
            .launching
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(session) = self.sessions.get(user_id) {
            session.touch();
            return Ok(session.clone());
        }

        let context = self.pool.ensure_context(user_id, seed).await?;
        let session = Arc::new(Session {
            user_id: user_id.clone(),
            context: std::sync::Mutex::new(context),
            groups: std::sync::Mutex::new(HashMap::new()),
            last_access: std::sync::Mutex::new(Instant::now()),
        });
        self.sessions.insert(user_id.clone(), session.clone());
        self.launching.remove(user_id);

        Ok(session)
    }

    pub async fn create_tab(
        &self,
        user_id: &UserId,
        list_item_id: &str,
        seed: Option<SeedOptions>,
    ) -> CoreResult<Arc<Tab>> {
        let session = self.get_session(user_id, seed).await?;
        let page = session
            .context()
            .new_page()
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        let tab = Arc::new(Tab::new(TabId::new(), user_id.clone(), list_item_id.to_string(), Arc::from(page)));

        session
            .groups
            .lock()
            .unwrap()
            .entry(list_item_id.to_string())
            .or_default()
            .tabs
            .insert(tab.tab_id, tab.clone());

        self.reverse_index.insert(tab.tab_id, user_id.clone());
        self.run_tab_created_hooks(&tab);
        Ok(tab)
    }

    /// Registered once by `Core::new` to forward each new tab's download
    /// events into the `DownloadRegistry`; kept as a hook (mirroring
    /// `ContextPool::on_evict`) so `SessionRegistry` stays ignorant of
    /// downloads as a concept.
    pub fn on_tab_created(&self, hook: Box<dyn Fn(Arc<Tab>) + Send + Sync>) {
        self.tab_created_hooks.lock().unwrap().push(hook);
    }

    fn run_tab_created_hooks(&self, tab: &Arc<Tab>) {
        for hook in self.tab_created_hooks.lock().unwrap().iter() {
            hook(tab.clone());
        }
    }

    /// Use the reverse index if present and owned by `user_id`; otherwise
    /// scan the user's sessions and repopulate the index on a hit. Returns
    /// `None` if the tab doesn't exist or belongs to another user — this is
    /// the one check that keeps tab ids from leaking across tenants.
    pub fn find_tab_by_id(&self, tab_id: &TabId, user_id: &UserId) -> Option<Arc<Tab>> {
        if let Some(owner) = self.reverse_index.get(tab_id) {
            if *owner != *user_id {
                return None;
            }
            return self.sessions.get(user_id).and_then(|s| s.tab(tab_id));
        }

        let session = self.sessions.get(user_id)?;
        let tab = session.tab(tab_id)?;
        self.reverse_index.insert(*tab_id, user_id.clone());
        Some(tab)
    }

    pub fn tabs_for_user(&self, user_id: &UserId) -> Vec<Arc<Tab>> {
        self.sessions.get(user_id).map(|s| s.tabs()).unwrap_or_default()
    }

    pub fn remove_tab(&self, tab_id: &TabId, user_id: &UserId) {
        self.reverse_index.remove(tab_id);
        if let Some(session) = self.sessions.get(user_id) {
            let mut groups = session.groups.lock().unwrap();
            groups.retain(|_, group| {
                group.tabs.remove(tab_id);
                !group.tabs.is_empty()
            });
        }
    }

    pub fn close_group(&self, user_id: &UserId, list_item_id: &str) -> Vec<TabId> {
        let Some(session) = self.sessions.get(user_id) else {
            return Vec::new();
        };
        let mut groups = session.groups.lock().unwrap();
        let Some(group) = groups.remove(list_item_id) else {
            return Vec::new();
        };
        let tab_ids: Vec<TabId> = group.tabs.keys().copied().collect();
        for tab_id in &tab_ids {
            self.reverse_index.remove(tab_id);
        }
        tab_ids
    }

    pub async fn close_sessions_for_user(&self, user_id: &UserId) {
        self.pool.close_context(user_id).await;
        if let Some((_, session)) = self.sessions.remove(user_id) {
            for tab in session.tabs() {
                self.reverse_index.remove(&tab.tab_id);
            }
        }
    }

    pub async fn close_all_sessions(&self) {
        self.pool.close_all().await;
        self.sessions.clear();
        self.reverse_index.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Evict sessions idle past `idle_timeout`. Run every 60s by the caller.
    pub async fn reap_idle(&self) {
        let expired: Vec<UserId> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > self.idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for user_id in &expired {
            debug!(user_id = %user_id, "reaping idle session");
            self.close_sessions_for_user(user_id).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "idle session reaper evicted sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ContextLauncher;
    use async_trait::async_trait;
    use tabd_engine::error::EngineResult;
    use tabd_engine::fake::FakeContext;
    use std::path::{Path, PathBuf};

    struct FakeLauncher;

    #[async_trait]
    impl ContextLauncher for FakeLauncher {
        async fn launch(&self, _profile_dir: &Path, _seed: &SeedOptions) -> EngineResult<Arc<dyn BrowserContext>> {
            Ok(FakeContext::new())
        }
    }

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn registry() -> SessionRegistry {
        let pool = Arc::new(ContextPool::new(PathBuf::from("/tmp/tabd-test-sessions"), 50, Arc::new(FakeLauncher)));
        SessionRegistry::with_defaults(pool)
    }

    #[tokio::test]
    async fn find_tab_by_id_denies_other_users() {
        let registry = registry();
        let tab = registry.create_tab(&uid("u1"), "s", None).await.unwrap();

        assert!(registry.find_tab_by_id(&tab.tab_id, &uid("u1")).is_some());
        assert!(registry.find_tab_by_id(&tab.tab_id, &uid("u2")).is_none());
    }

    #[tokio::test]
    async fn close_group_removes_all_its_tabs_from_the_index() {
        let registry = registry();
        let user = uid("u1");
        let t1 = registry.create_tab(&user, "group-a", None).await.unwrap();
        let t2 = registry.create_tab(&user, "group-a", None).await.unwrap();
        let _t3 = registry.create_tab(&user, "group-b", None).await.unwrap();

        let closed = registry.close_group(&user, "group-a");
        assert_eq!(closed.len(), 2);
        assert!(registry.find_tab_by_id(&t1.tab_id, &user).is_none());
        assert!(registry.find_tab_by_id(&t2.tab_id, &user).is_none());
    }
}
