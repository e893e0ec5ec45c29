//! Download bookkeeping shared between the in-memory registry and its
//! on-disk JSON snapshot (`{downloadsDir}/registry.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{TabId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Completed,
    Failed,
    Canceled,
}

impl DownloadStatus {
    /// Pending entries are exempt from both LRU eviction and TTL cleanup.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: String,
    pub user_id: UserId,
    pub tab_id: TabId,
    pub url: String,
    pub suggested_filename: String,
    pub saved_filename: String,
    pub mime_type: String,
    pub size: u64,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Relative URL at which the finished file can be fetched back, e.g.
    /// `/downloads/{id}/content`.
    pub content_url: String,
}

impl DownloadInfo {
    /// `savedFilename = "{id}_{sanitized_suggested}"`.
    pub fn saved_filename(id: &str, sanitized_suggested: &str) -> String {
        format!("{id}_{sanitized_suggested}")
    }

    /// Timestamp used for oldest-first LRU eviction: `completedAt ?? createdAt`.
    pub fn eviction_timestamp(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Replace `\` and `/` with `_`, strip NUL bytes, trim, cap at 200 chars.
/// Falls back to `"download"` when the result would be empty.
pub fn sanitize_filename(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| if c == '\\' || c == '/' { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    let capped: String = trimmed.chars().take(200).collect();
    if capped.is_empty() {
        "download".to_string()
    } else {
        capped
    }
}

/// Extension-keyed MIME guess, case-insensitive, last-dot wins for
/// multi-dot names. Unknown extensions fall back to the generic octet type.
pub fn guess_mime_from_extension(filename: &str) -> String {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    let mime = match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
    }

    #[test]
    fn sanitize_empty_falls_back() {
        assert_eq!(sanitize_filename("   "), "download");
        assert_eq!(sanitize_filename("\0\0"), "download");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), 200);
    }

    #[test]
    fn mime_guess_is_case_insensitive_and_last_dot() {
        assert_eq!(guess_mime_from_extension("report.FINAL.PDF"), "application/pdf");
        assert_eq!(guess_mime_from_extension("noext"), "application/octet-stream");
    }
}
