//! In-memory download registry with a debounced, atomically-rewritten JSON
//! snapshot and crash-safe startup reconciliation against the files
//! actually on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tabd_engine::traits::DownloadHandle;
use tabd_types::download::{guess_mime_from_extension, sanitize_filename};
use tabd_types::{CoreError, CoreResult, DownloadInfo, DownloadStatus, TabId, UserId};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_MAX_PER_USER: usize = 500;
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SAVE_TICK: Duration = Duration::from_secs(1);

pub struct DownloadRegistryConfig {
    pub downloads_dir: PathBuf,
    pub max_per_user: usize,
    pub max_size_mb: u64,
    pub ttl: Duration,
}

impl DownloadRegistryConfig {
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self {
            downloads_dir,
            max_per_user: DEFAULT_MAX_PER_USER,
            max_size_mb: 500,
            ttl: DEFAULT_TTL,
        }
    }
}

pub struct DownloadRegistry {
    config: DownloadRegistryConfig,
    entries: DashMap<String, DownloadInfo>,
    dirty: AtomicBool,
}

impl DownloadRegistry {
    pub fn new(config: DownloadRegistryConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    fn registry_path(&self) -> PathBuf {
        self.config.downloads_dir.join("registry.json")
    }

    fn user_dir(&self, user_id: &UserId) -> PathBuf {
        self.config.downloads_dir.join(user_id.urlencoded())
    }

    /// On boot: drop registry entries whose backing file vanished, adopt
    /// orphan files on disk as `completed` entries, then persist the
    /// rebuilt registry immediately.
    pub async fn reconcile_on_startup(&self) -> CoreResult<()> {
        tokio::fs::create_dir_all(&self.config.downloads_dir)
            .await
            .map_err(|e| CoreError::engine(format!("downloads dir: {e}")))?;

        if let Ok(raw) = tokio::fs::read_to_string(self.registry_path()).await {
            if let Ok(loaded) = serde_json::from_str::<HashMap<String, DownloadInfo>>(&raw) {
                for (id, info) in loaded {
                    let path = self.user_dir(&info.user_id).join(&info.saved_filename);
                    if tokio::fs::metadata(&path).await.is_ok() {
                        self.entries.insert(id, info);
                    }
                }
            }
        }

        let mut dirs = match tokio::fs::read_dir(&self.config.downloads_dir).await {
            Ok(d) => d,
            Err(_) => return self.save_now().await,
        };
        while let Ok(Some(user_dir_entry)) = dirs.next_entry().await {
            if !user_dir_entry.path().is_dir() {
                continue;
            }
            let Ok(user_id) = urlencoding::decode(&user_dir_entry.file_name().to_string_lossy())
                .map(|s| s.into_owned())
            else {
                continue;
            };
            let Ok(user_id) = UserId::new(user_id) else { continue };

            let Ok(mut files) = tokio::fs::read_dir(user_dir_entry.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let file_name = file.file_name().to_string_lossy().into_owned();
                let Some((maybe_uuid, rest)) = file_name.split_once('_') else {
                    continue;
                };
                if Uuid::parse_str(maybe_uuid).is_err() {
                    continue;
                }
                if self.entries.contains_key(maybe_uuid) {
                    continue;
                }
                let metadata = match file.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let created_at = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .and_then(|d| chrono::DateTime::<Utc>::from_timestamp(d.as_secs() as i64, 0))
                    .unwrap_or_else(Utc::now);

                info!(id = %maybe_uuid, user_id = %user_id, "adopting orphan download file found on disk");
                self.entries.insert(
                    maybe_uuid.to_string(),
                    DownloadInfo {
                        id: maybe_uuid.to_string(),
                        user_id: user_id.clone(),
                        tab_id: unknown_tab_id(),
                        url: String::new(),
                        suggested_filename: rest.to_string(),
                        saved_filename: file_name.clone(),
                        mime_type: guess_mime_from_extension(rest),
                        size: metadata.len(),
                        status: DownloadStatus::Completed,
                        error: None,
                        created_at,
                        completed_at: Some(created_at),
                        content_url: format!("/downloads/{maybe_uuid}/content"),
                    },
                );
            }
        }

        self.save_now().await
    }

    /// Allocate an id, pick the saved filename, evict the oldest
    /// non-pending entry if the user is already at capacity, then insert a
    /// `pending` entry and return it for the caller to begin `save_as`
    /// against.
    pub async fn start_download(&self, user_id: &UserId, tab_id: TabId, url: &str, suggested_filename: &str) -> CoreResult<DownloadInfo> {
        self.evict_oldest_if_over_cap(user_id).await?;

        let id = Uuid::new_v4().to_string();
        let sanitized = sanitize_filename(suggested_filename);
        let saved_filename = DownloadInfo::saved_filename(&id, &sanitized);
        let user_dir = self.user_dir(user_id);
        tokio::fs::create_dir_all(&user_dir)
            .await
            .map_err(|e| CoreError::engine(format!("user download dir: {e}")))?;

        let info = DownloadInfo {
            id: id.clone(),
            user_id: user_id.clone(),
            tab_id,
            url: url.to_string(),
            suggested_filename: sanitized,
            saved_filename,
            mime_type: String::new(),
            size: 0,
            status: DownloadStatus::Pending,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            content_url: format!("/downloads/{id}/content"),
        };
        self.entries.insert(id, info.clone());
        self.mark_dirty();
        Ok(info)
    }

    /// Drive `handle` to completion against the file path reserved by
    /// `start_download`, then stamp status/size/error onto the entry.
    pub async fn finalize_download(&self, id: &str, handle: &dyn DownloadHandle) {
        let Some(mut entry) = self.entries.get_mut(id) else { return };
        let path = self.user_dir(&entry.user_id).join(&entry.saved_filename);

        if let Some(failure) = handle.failure().await {
            entry.status = if failure.to_lowercase().contains("cancel") {
                DownloadStatus::Canceled
            } else {
                DownloadStatus::Failed
            };
            entry.error = Some(failure);
            entry.completed_at = Some(Utc::now());
            drop(entry);
            self.mark_dirty();
            return;
        }

        if let Err(e) = handle.save_as(&path).await {
            entry.status = DownloadStatus::Failed;
            entry.error = Some(e.to_string());
            entry.completed_at = Some(Utc::now());
            drop(entry);
            self.mark_dirty();
            return;
        }

        match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                let max_bytes = self.config.max_size_mb * 1024 * 1024;
                if metadata.len() > max_bytes {
                    let _ = tokio::fs::remove_file(&path).await;
                    entry.status = DownloadStatus::Failed;
                    entry.error = Some(format!("exceeded max download size of {}MB", self.config.max_size_mb));
                } else {
                    entry.size = metadata.len();
                    entry.mime_type = guess_mime_from_extension(&entry.suggested_filename.clone());
                    entry.status = DownloadStatus::Completed;
                }
                entry.completed_at = Some(Utc::now());
            }
            Err(e) => {
                entry.status = DownloadStatus::Failed;
                entry.error = Some(e.to_string());
                entry.completed_at = Some(Utc::now());
            }
        }
        drop(entry);
        self.mark_dirty();
    }

    /// Finalize a download whose bytes were produced directly (resource
    /// extraction's batch downloader fetches `data:`/`blob:`/`http(s)`
    /// candidates itself rather than driving a browser download event), so
    /// there is no [`DownloadHandle`] to hand to `finalize_download`.
    pub async fn complete_with_bytes(&self, id: &str, bytes: &[u8]) -> CoreResult<()> {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return Err(CoreError::not_found(format!("download {id} not found")));
        };
        let max_bytes = self.config.max_size_mb * 1024 * 1024;
        if bytes.len() as u64 > max_bytes {
            entry.status = DownloadStatus::Failed;
            entry.error = Some(format!("exceeded max download size of {}MB", self.config.max_size_mb));
            entry.completed_at = Some(Utc::now());
            drop(entry);
            self.mark_dirty();
            return Ok(());
        }

        let path = self.user_dir(&entry.user_id).join(&entry.saved_filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CoreError::engine(format!("writing download: {e}")))?;
        entry.size = bytes.len() as u64;
        entry.mime_type = guess_mime_from_extension(&entry.suggested_filename.clone());
        entry.status = DownloadStatus::Completed;
        entry.completed_at = Some(Utc::now());
        drop(entry);
        self.mark_dirty();
        Ok(())
    }

    /// Mark a started download as failed without ever producing bytes, used
    /// by the batch downloader for candidates it refuses or can't fetch.
    pub fn fail_download(&self, id: &str, reason: impl Into<String>) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.status = DownloadStatus::Failed;
            entry.error = Some(reason.into());
            entry.completed_at = Some(Utc::now());
            drop(entry);
            self.mark_dirty();
        }
    }

    async fn evict_oldest_if_over_cap(&self, user_id: &UserId) -> CoreResult<()> {
        let max = if self.config.max_per_user == 0 { DEFAULT_MAX_PER_USER } else { self.config.max_per_user };
        let user_entries: Vec<DownloadInfo> = self
            .entries
            .iter()
            .filter(|e| e.value().user_id == *user_id)
            .map(|e| e.value().clone())
            .collect();
        if user_entries.len() < max {
            return Ok(());
        }

        let victim = user_entries
            .into_iter()
            .filter(|d| d.status.is_terminal())
            .min_by_key(|d| d.eviction_timestamp());

        let Some(victim) = victim else {
            // Every entry is pending: spec says pending entries are never
            // evicted, so the cap is temporarily exceeded rather than
            // dropping in-flight work.
            warn!(user_id = %user_id, "download cap reached with no evictable (non-pending) entry");
            return Ok(());
        };

        let path = self.user_dir(user_id).join(&victim.saved_filename);
        let _ = tokio::fs::remove_file(&path).await;
        self.entries.remove(&victim.id);
        debug!(user_id = %user_id, evicted = %victim.id, "evicted oldest completed download over cap");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<DownloadInfo> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn list_for_user(&self, user_id: &UserId) -> Vec<DownloadInfo> {
        self.entries.iter().filter(|e| e.value().user_id == *user_id).map(|e| e.value().clone()).collect()
    }

    pub fn list_for_tab(&self, tab_id: TabId) -> Vec<DownloadInfo> {
        self.entries.iter().filter(|e| e.value().tab_id == tab_id).map(|e| e.value().clone()).collect()
    }

    /// Entries of `tab_id` created within `window` of now, inlined by the
    /// click action's response when a click triggered a download.
    pub fn recent_for_tab(&self, tab_id: TabId, window: Duration) -> Vec<DownloadInfo> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        self.entries
            .iter()
            .filter(|e| e.value().tab_id == tab_id && e.value().created_at >= cutoff)
            .map(|e| e.value().clone())
            .collect()
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let Some((_, entry)) = self.entries.remove(id) else {
            return Err(CoreError::not_found(format!("download {id} not found")));
        };
        let path = self.user_dir(&entry.user_id).join(&entry.saved_filename);
        let _ = tokio::fs::remove_file(&path).await;
        self.mark_dirty();
        Ok(())
    }

    pub fn content_path(&self, id: &str) -> CoreResult<PathBuf> {
        let entry = self.entries.get(id).ok_or_else(|| CoreError::not_found(format!("download {id} not found")))?;
        if entry.status != DownloadStatus::Completed {
            return Err(CoreError::Conflict(format!("download {id} is not completed")));
        }
        Ok(self.user_dir(&entry.user_id).join(&entry.saved_filename))
    }

    /// Run every 60s: drop terminal entries older than the configured TTL.
    /// Pending entries are never touched.
    pub async fn ttl_sweep(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.ttl).unwrap_or_default();
        let expired: Vec<(String, PathBuf)> = self
            .entries
            .iter()
            .filter(|e| e.value().status.is_terminal() && e.value().eviction_timestamp() < cutoff)
            .map(|e| (e.key().clone(), self.user_dir(&e.value().user_id).join(&e.value().saved_filename)))
            .collect();
        if expired.is_empty() {
            return;
        }
        for (id, path) in &expired {
            let _ = tokio::fs::remove_file(path).await;
            self.entries.remove(id);
        }
        info!(count = expired.len(), "download TTL sweep removed expired entries");
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn save_now(&self) -> CoreResult<()> {
        let snapshot: HashMap<String, DownloadInfo> = self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let serialized = serde_json::to_vec_pretty(&snapshot).map_err(|e| CoreError::engine(e.to_string()))?;

        let final_path = self.registry_path();
        let tmp_path = final_path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CoreError::engine(format!("registry tmp file: {e}")))?;
        file.write_all(&serialized).await.map_err(|e| CoreError::engine(e.to_string()))?;
        file.flush().await.map_err(|e| CoreError::engine(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| CoreError::engine(e.to_string()))?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Background debounce loop: every tick, save once if a mutation
    /// happened since the last save. Run as a spawned task for the life of
    /// the process.
    pub async fn run_save_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SAVE_TICK);
        loop {
            interval.tick().await;
            if self.dirty.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.save_now().await {
                    warn!(error = %e, "failed to persist download registry");
                    self.mark_dirty();
                }
            }
        }
    }

    /// Called from the shutdown path to guarantee the final state hits disk.
    pub async fn flush(&self) {
        if let Err(e) = self.save_now().await {
            warn!(error = %e, "failed to flush download registry on shutdown");
        }
    }

    pub fn path_for_evicting(&self, user_id: &UserId, filename: &str) -> PathBuf {
        self.user_dir(user_id).join(filename)
    }
}

fn unknown_tab_id() -> TabId {
    // `adopted` entries from an orphan file predate any tab bookkeeping;
    // "unknown" is represented as a fresh id since `TabId` carries no
    // sentinel value, and these entries are never looked up by tab.
    TabId::new()
}

#[allow(dead_code)]
fn _path_exists_sync(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabd_engine::error::EngineResult;
    use async_trait::async_trait;

    struct OkHandle;
    #[async_trait]
    impl DownloadHandle for OkHandle {
        async fn save_as(&self, path: &Path) -> EngineResult<()> {
            tokio::fs::write(path, b"hello").await.unwrap();
            Ok(())
        }
        async fn failure(&self) -> Option<String> {
            None
        }
    }

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[tokio::test]
    async fn start_then_finalize_marks_completed_with_size() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DownloadRegistry::new(DownloadRegistryConfig::new(dir.path().to_path_buf()));
        let user = uid("u1");
        let info = registry.start_download(&user, TabId::new(), "https://x/file.txt", "file.txt").await.unwrap();

        registry.finalize_download(&info.id, &OkHandle).await;

        let updated = registry.get(&info.id).unwrap();
        assert_eq!(updated.status, DownloadStatus::Completed);
        assert_eq!(updated.size, 5);
    }

    #[tokio::test]
    async fn eviction_never_removes_pending_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DownloadRegistryConfig::new(dir.path().to_path_buf());
        config.max_per_user = 2;
        let registry = DownloadRegistry::new(config);
        let user = uid("u1");

        let a = registry.start_download(&user, TabId::new(), "https://x/a", "a").await.unwrap();
        registry.finalize_download(&a.id, &OkHandle).await;
        let _pending = registry.start_download(&user, TabId::new(), "https://x/b", "b").await.unwrap();
        let _third = registry.start_download(&user, TabId::new(), "https://x/c", "c").await.unwrap();

        assert!(registry.get(&a.id).is_none());
        assert_eq!(registry.list_for_user(&user).len(), 2);
    }
}
