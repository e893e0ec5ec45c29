//! Scoped DOM resource extraction and bounded-concurrency batch downloads.
//!
//! Extraction is a single in-page script call, in the same spirit as
//! `ActionsEngine::evaluate`: build one JS expression, run it through
//! `PageHandle::evaluate`, and deserialize the JSON it returns. Nothing here
//! walks the DOM from the Rust side.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabd_engine::traits::{BrowserContext, PageHandle};
use tabd_types::{CoreError, CoreResult, DownloadStatus, TabId, UserId};
use tracing::warn;

use crate::downloads::DownloadRegistry;

const MAX_LAZY_LOAD_IMAGES: usize = 50;
const MAX_BLOB_REPLACEMENTS: usize = 25;
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv", "zip", "txt", "json", "xml",
];
const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceItem {
    pub url: String,
    #[serde(default)]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractedResources {
    pub images: Vec<ResourceItem>,
    pub links: Vec<ResourceItem>,
    pub media: Vec<ResourceItem>,
    pub documents: Vec<ResourceItem>,
    pub blob_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractOptions {
    #[serde(default = "default_container_selector")]
    pub container_selector: String,
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub trigger_lazy_load: bool,
}

fn default_container_selector() -> String {
    "body".to_string()
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            container_selector: "body".to_string(),
            extensions: None,
            trigger_lazy_load: false,
        }
    }
}

/// Raw per-bucket URL lists as returned by the in-page script, before the
/// document/link split and extension filter are applied.
#[derive(Deserialize)]
struct RawExtraction {
    images: Vec<ResourceItem>,
    anchors: Vec<ResourceItem>,
    media: Vec<ResourceItem>,
}

pub struct ResourceExtractor;

impl ResourceExtractor {
    /// Run the extraction script against `page`, then bucket anchors into
    /// `links`/`documents` and apply the caller's extension filter.
    pub async fn extract(page: &dyn PageHandle, opts: &ExtractOptions) -> CoreResult<ExtractedResources> {
        let script = build_extraction_script(opts);
        let value = page
            .evaluate(&script)
            .await
            .map_err(|e| CoreError::engine(format!("resource extraction: {e}")))?;
        let raw: RawExtraction = serde_json::from_value(value)
            .map_err(|e| CoreError::engine(format!("resource extraction decode: {e}")))?;

        let mut images = raw.images;
        let mut media = raw.media;
        let mut links = Vec::new();
        let mut documents = Vec::new();
        for anchor in raw.anchors {
            if extension_of(&anchor.url).is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str())) {
                documents.push(anchor);
            } else {
                links.push(anchor);
            }
        }

        if let Some(allowed) = &opts.extensions {
            let allowed: Vec<String> = allowed.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect();
            let keep = |item: &ResourceItem| {
                extension_of(&item.url).is_some_and(|ext| allowed.contains(&ext))
            };
            images.retain(keep);
            links.retain(keep);
            media.retain(keep);
            documents.retain(keep);
        }

        let mut blob_urls: Vec<String> = images
            .iter()
            .chain(links.iter())
            .chain(media.iter())
            .chain(documents.iter())
            .map(|item| item.url.clone())
            .filter(|url| url.starts_with("blob:"))
            .collect();
        blob_urls.sort();
        blob_urls.dedup();

        Ok(ExtractedResources {
            images,
            links,
            media,
            documents,
            blob_urls,
        })
    }

    /// Resolve at most [`MAX_BLOB_REPLACEMENTS`] `blob:` URLs to data URIs by
    /// running `fetch -> Blob -> FileReader` inside the page, then return
    /// `resources` with every resolvable blob URL substituted in place.
    pub async fn resolve_blobs(
        page: &dyn PageHandle,
        resources: ExtractedResources,
    ) -> CoreResult<ExtractedResources> {
        let mut replacements: HashMap<String, String> = HashMap::new();
        for blob_url in resources.blob_urls.iter().take(MAX_BLOB_REPLACEMENTS) {
            match resolve_one_blob(page, blob_url).await {
                Ok(data_uri) => {
                    replacements.insert(blob_url.clone(), data_uri);
                }
                Err(e) => {
                    warn!(url = %blob_url, error = %e, "failed to resolve blob url");
                }
            }
        }
        if replacements.is_empty() {
            return Ok(resources);
        }

        let substitute = |mut items: Vec<ResourceItem>| {
            for item in &mut items {
                if let Some(data_uri) = replacements.get(&item.url) {
                    item.url = data_uri.clone();
                }
            }
            items
        };

        Ok(ExtractedResources {
            images: substitute(resources.images),
            links: substitute(resources.links),
            media: substitute(resources.media),
            documents: substitute(resources.documents),
            blob_urls: resources
                .blob_urls
                .into_iter()
                .filter(|u| !replacements.contains_key(u))
                .collect(),
        })
    }
}

async fn resolve_one_blob(page: &dyn PageHandle, blob_url: &str) -> CoreResult<String> {
    let script = format!(
        "(async () => {{
            const res = await fetch({blob_url:?});
            const blob = await res.blob();
            return await new Promise((resolve, reject) => {{
                const reader = new FileReader();
                reader.onloadend = () => resolve(reader.result);
                reader.onerror = () => reject(reader.error);
                reader.readAsDataURL(blob);
            }});
        }})()"
    );
    let value = page
        .evaluate(&script)
        .await
        .map_err(|e| CoreError::engine(format!("blob resolution: {e}")))?;
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| CoreError::engine("blob resolution returned a non-string result"))
}

fn build_extraction_script(opts: &ExtractOptions) -> String {
    let container = serde_json::to_string(&opts.container_selector).unwrap_or_else(|_| "\"body\"".to_string());
    let lazy_load_block = if opts.trigger_lazy_load {
        format!(
            "const lazyImgs = Array.from(container.querySelectorAll('img')).slice(0, {MAX_LAZY_LOAD_IMAGES});
             for (const img of lazyImgs) {{ img.scrollIntoView({{block: 'center'}}); }}
             await new Promise(r => setTimeout(r, 50));"
        )
    } else {
        String::new()
    };

    format!(
        "(async () => {{
            const container = document.querySelector({container}) || document.body;
            {lazy_load_block}
            const base = document.baseURI;
            const toAbs = (u) => {{ try {{ return new URL(u, base).href; }} catch (e) {{ return null; }} }};
            const images = [];
            for (const el of container.querySelectorAll('img')) {{
                const src = el.currentSrc || el.src;
                const abs = src ? toAbs(src) : null;
                if (abs) images.push({{url: abs, alt: el.alt || null}});
            }}
            const anchors = [];
            for (const el of container.querySelectorAll('a[href]')) {{
                const abs = toAbs(el.getAttribute('href'));
                if (abs) anchors.push({{url: abs, alt: el.textContent ? el.textContent.trim().slice(0, 200) : null}});
            }}
            const media = [];
            for (const el of container.querySelectorAll('video, audio, source')) {{
                const src = el.currentSrc || el.src;
                const abs = src ? toAbs(src) : null;
                if (abs) media.push({{url: abs, alt: null}});
            }}
            return {{images, anchors, media}};
        }})()"
    )
}

fn extension_of(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = without_query.rsplit('/').next().unwrap_or(without_query);
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 10 {
        return None;
    }
    Some(ext.to_lowercase())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDownloadCandidate {
    pub url: String,
    pub suggested_filename: String,
}

#[derive(Debug, Clone)]
pub struct BatchDownloaderConfig {
    pub max_files: usize,
    pub max_batch_concurrency: usize,
    pub max_blob_size_mb: u64,
    pub max_download_size_mb: u64,
    pub resolve_blobs: bool,
}

impl Default for BatchDownloaderConfig {
    fn default() -> Self {
        Self {
            max_files: 50,
            max_batch_concurrency: 5,
            max_blob_size_mb: 50,
            max_download_size_mb: 500,
            resolve_blobs: true,
        }
    }
}

impl BatchDownloaderConfig {
    /// Clamp `max_files` into the spec's `[1, 500]` band.
    pub fn clamped(mut self) -> Self {
        self.max_files = self.max_files.clamp(1, 500);
        if self.max_batch_concurrency == 0 {
            self.max_batch_concurrency = 1;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchDownloadOutcome {
    pub id: String,
    pub url: String,
    pub status: DownloadStatus,
    pub error: Option<String>,
}

pub struct BatchDownloader;

impl BatchDownloader {
    /// Register then drive each (bounded) candidate to completion under a
    /// semaphore of `max_batch_concurrency`. A candidate-level error only
    /// fails that candidate; an error acquiring `context`/`page` resources
    /// fails the whole batch, marking every still-pending entry `failed`.
    pub async fn run(
        registry: &DownloadRegistry,
        context: &dyn BrowserContext,
        page: &dyn PageHandle,
        user_id: &UserId,
        tab_id: TabId,
        candidates: Vec<BatchDownloadCandidate>,
        config: &BatchDownloaderConfig,
    ) -> CoreResult<Vec<BatchDownloadOutcome>> {
        let config = config.clone().clamped();
        let bounded: Vec<BatchDownloadCandidate> = candidates.into_iter().take(config.max_files).collect();

        let mut pending_ids = Vec::with_capacity(bounded.len());
        let mut jobs = Vec::with_capacity(bounded.len());
        for candidate in bounded {
            let info = registry
                .start_download(user_id, tab_id, &candidate.url, &candidate.suggested_filename)
                .await?;
            pending_ids.push(info.id.clone());
            jobs.push((info.id, candidate));
        }

        use futures::stream::StreamExt;
        let results = std::sync::Mutex::new(HashMap::new());
        futures::stream::iter(jobs)
            .for_each_concurrent(config.max_batch_concurrency, |(id, candidate)| {
                let results = &results;
                let config = &config;
                async move {
                    let outcome = process_one_candidate(registry, context, page, &id, &candidate, config).await;
                    results.lock().unwrap().insert(id, outcome);
                }
            })
            .await;

        let results = results.into_inner().unwrap();
        let mut outcomes = Vec::with_capacity(pending_ids.len());
        for id in pending_ids {
            let (status, error) = results
                .get(&id)
                .cloned()
                .unwrap_or((DownloadStatus::Failed, Some("batch download did not complete".to_string())));
            if status == DownloadStatus::Failed && registry.get(&id).map(|d| d.status == DownloadStatus::Pending).unwrap_or(false) {
                registry.fail_download(&id, error.clone().unwrap_or_else(|| "batch download failed".to_string()));
            }
            let url = registry.get(&id).map(|d| d.url).unwrap_or_default();
            outcomes.push(BatchDownloadOutcome { id, url, status, error });
        }
        Ok(outcomes)
    }
}

async fn process_one_candidate(
    registry: &DownloadRegistry,
    context: &dyn BrowserContext,
    page: &dyn PageHandle,
    id: &str,
    candidate: &BatchDownloadCandidate,
    config: &BatchDownloaderConfig,
) -> (DownloadStatus, Option<String>) {
    let result = if let Some(rest) = candidate.url.strip_prefix("data:") {
        decode_data_uri(rest).and_then(|bytes| {
            check_size(bytes.len() as u64, config.max_blob_size_mb).map(|_| bytes)
        })
    } else if candidate.url.starts_with("blob:") {
        if !config.resolve_blobs {
            Err("blob resolution disabled for this batch".to_string())
        } else {
            match resolve_one_blob(page, &candidate.url).await {
                Ok(data_uri) => decode_data_uri(data_uri.strip_prefix("data:").unwrap_or(&data_uri))
                    .and_then(|bytes| check_size(bytes.len() as u64, config.max_blob_size_mb).map(|_| bytes)),
                Err(e) => Err(e.to_string()),
            }
        }
    } else {
        match context.request_get(&candidate.url, HTTP_FETCH_TIMEOUT).await {
            Ok(bytes) => check_size(bytes.len() as u64, config.max_download_size_mb).map(|_| bytes),
            Err(e) => Err(e.to_string()),
        }
    };

    match result {
        Ok(bytes) => match registry.complete_with_bytes(id, &bytes).await {
            Ok(()) => (DownloadStatus::Completed, None),
            Err(e) => {
                registry.fail_download(id, e.to_string());
                (DownloadStatus::Failed, Some(e.to_string()))
            }
        },
        Err(reason) => {
            registry.fail_download(id, reason.clone());
            (DownloadStatus::Failed, Some(reason))
        }
    }
}

fn check_size(len: u64, cap_mb: u64) -> Result<(), String> {
    let cap_bytes = cap_mb * 1024 * 1024;
    if len > cap_bytes {
        Err(format!("exceeded max size of {cap_mb}MB"))
    } else {
        Ok(())
    }
}

/// Decode the payload of a `data:` URI (without the `data:` prefix), either
/// base64 (`;base64,`) or URL-encoded.
fn decode_data_uri(rest: &str) -> Result<Vec<u8>, String> {
    let (meta, payload) = rest.split_once(',').ok_or_else(|| "malformed data: URI".to_string())?;
    if meta.contains(";base64") {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| format!("invalid base64 data uri: {e}"))
    } else {
        Ok(urlencoding::decode(payload)
            .map(|s| s.into_owned().into_bytes())
            .unwrap_or_else(|_| payload.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_of_handles_query_and_fragment() {
        assert_eq!(extension_of("https://x/a/file.PDF?x=1#y"), Some("pdf".to_string()));
        assert_eq!(extension_of("https://x/a/file"), None);
        assert_eq!(extension_of("https://x/a/"), None);
    }

    #[test]
    fn decode_data_uri_handles_base64_and_plain() {
        let bytes = decode_data_uri(";base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
        let bytes = decode_data_uri(",hello%20world").unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn batch_downloader_config_clamps_max_files() {
        let config = BatchDownloaderConfig {
            max_files: 10_000,
            ..Default::default()
        }
        .clamped();
        assert_eq!(config.max_files, 500);

        let config = BatchDownloaderConfig {
            max_files: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(config.max_files, 1);
    }
}
