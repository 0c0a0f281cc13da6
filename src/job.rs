//! Job and segment records.
//!
//! A `Job` is one logical download identified by a caller-supplied stable
//! key. While a task is running it owns the job by value; at rest the
//! scheduler's arena holds it. Nothing in the engine derives identity from
//! the URL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DownloadError;
use crate::status::DownloadStatus;

/// One contiguous byte range of a job, downloaded by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Identity of the owning job.
    pub job_key: String,
    /// Stable across resumes: `"<save_path>_<ordinal>"`, ordinal 1-based.
    pub key: String,
    /// First byte offset (inclusive).
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
    /// Bytes transferred so far; resume offset is `start + transferred`.
    pub transferred: u64,
}

impl Segment {
    /// Deterministic segment key for the given destination and 1-based ordinal.
    pub fn key_for(save_path: &std::path::Path, ordinal: usize) -> String {
        format!("{}_{}", save_path.display(), ordinal)
    }

    /// Total bytes this segment covers. Bounds are inclusive, so a segment
    /// is never empty.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// One logical download.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque caller-supplied identity, unique among active and historical jobs.
    pub key: String,
    pub url: String,
    pub save_path: PathBuf,
    /// Expected lowercase hex MD5 of the finished file, if the caller has one.
    pub checksum: Option<String>,
    pub supports_ranges: bool,
    /// Total size in bytes; `None` until probed.
    pub size: Option<u64>,
    /// Cumulative bytes transferred, kept equal to the sum over segments.
    pub progress: u64,
    /// Milliseconds since epoch.
    pub created_at: i64,
    pub updated_at: i64,
    /// Failed attempts recorded so far. The engine increments this on
    /// failure but leaves re-enqueueing to the caller.
    pub retry_count: u32,
    pub status: DownloadStatus,
    /// Segment map keyed by segment key; insertion order irrelevant.
    pub segments: HashMap<String, Segment>,
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Recomputes `progress` as the sum of all segment transferred counts.
    pub fn recompute_progress(&mut self) -> u64 {
        self.progress = self.segments.values().map(|s| s.transferred).sum();
        self.progress
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Fail-fast job construction. Missing url/key/path are reported here,
/// before the job can ever reach the scheduler.
#[derive(Debug, Default)]
pub struct JobBuilder {
    key: Option<String>,
    url: Option<String>,
    save_path: Option<PathBuf>,
    checksum: Option<String>,
    size: Option<u64>,
    supports_ranges: bool,
}

impl JobBuilder {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Expected content hash; compared by exact string equality after the
    /// last segment finishes.
    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Pre-known total size, when the caller already has it. Skips the probe.
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn supports_ranges(mut self, supports: bool) -> Self {
        self.supports_ranges = supports;
        self
    }

    pub fn build(self) -> Result<Job, DownloadError> {
        let key = match self.key {
            Some(k) if !k.is_empty() => k,
            _ => return Err(DownloadError::IdentityMissing),
        };
        let url = match self.url {
            Some(u) if !u.is_empty() => u,
            _ => return Err(DownloadError::UrlMissing),
        };
        if url::Url::parse(&url).is_err() {
            return Err(DownloadError::UrlMissing);
        }
        let save_path = match self.save_path {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => return Err(DownloadError::SavePathMissing),
        };

        let now = now_millis();
        Ok(Job {
            key,
            url,
            save_path,
            checksum: self.checksum,
            supports_ranges: self.supports_ranges,
            size: self.size,
            progress: 0,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            status: DownloadStatus::None,
            segments: HashMap::new(),
        })
    }
}
