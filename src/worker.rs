//! Segment worker: blocking transfer of one byte range into the job file.
//!
//! Each worker copies `[start + transferred, end]` of the job's URL into the
//! destination file at the matching offset. Progress is reported per chunk
//! over the task's channel; the terminal outcome is exactly one `Done` or
//! `Failed` event, or nothing at all when the worker was cancelled. The curl
//! handle is dropped on every exit path, so the connection is always
//! released.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::control::CancelToken;
use crate::error::DownloadError;
use crate::storage::JobFile;

/// Event a worker reports to its owning task.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Cumulative bytes transferred for this segment.
    Progress { segment_key: String, transferred: u64 },
    /// The response body is exhausted; the segment is complete.
    Done { segment_key: String },
    /// Transport or storage failure; the segment keeps its progress.
    Failed {
        segment_key: String,
        error: DownloadError,
    },
}

/// Everything a worker needs to know about its slice of the job.
#[derive(Debug, Clone)]
pub(crate) struct SegmentSpec {
    pub url: String,
    pub segment_key: String,
    pub start: u64,
    pub end: u64,
    pub transferred: u64,
    pub supports_ranges: bool,
}

/// Runs one segment transfer to completion, cancellation or failure.
/// Blocking; the task runs one OS thread per segment.
pub(crate) fn run_segment(
    spec: SegmentSpec,
    file: JobFile,
    cancel: CancelToken,
    config: &DownloadConfig,
    tx: Sender<WorkerEvent>,
) {
    match transfer(&spec, &file, &cancel, config, &tx) {
        Ok(()) => {
            let _ = tx.send(WorkerEvent::Done {
                segment_key: spec.segment_key,
            });
        }
        Err(Outcome::Cancelled) => {
            tracing::debug!(segment = %spec.segment_key, "segment cancelled");
        }
        Err(Outcome::Failed(error)) => {
            tracing::warn!(segment = %spec.segment_key, %error, "segment failed");
            let _ = tx.send(WorkerEvent::Failed {
                segment_key: spec.segment_key,
                error,
            });
        }
    }
}

enum Outcome {
    Cancelled,
    Failed(DownloadError),
}

fn transfer(
    spec: &SegmentSpec,
    file: &JobFile,
    cancel: &CancelToken,
    config: &DownloadConfig,
    tx: &Sender<WorkerEvent>,
) -> Result<(), Outcome> {
    // Without range support the server always replays the full resource, so
    // the copy restarts at offset zero and prior progress is discarded.
    let (resume_offset, base_transferred) = if spec.supports_ranges {
        (spec.start + spec.transferred, spec.transferred)
    } else {
        (0, 0)
    };

    let curl_err = |e: curl::Error| Outcome::Failed(DownloadError::Transport(e.to_string()));

    let mut easy = curl::easy::Easy::new();
    easy.url(&spec.url).map_err(curl_err)?;
    easy.follow_location(true).map_err(curl_err)?;
    easy.connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .map_err(curl_err)?;
    // Read timeout as a stall detector: abort when no data moves for the
    // configured window, instead of a wall-clock cap that would kill large
    // segments on slow links.
    easy.low_speed_limit(1).map_err(curl_err)?;
    easy.low_speed_time(Duration::from_millis(config.read_timeout_ms))
        .map_err(curl_err)?;
    if !config.method.eq_ignore_ascii_case("GET") {
        easy.custom_request(&config.method).map_err(curl_err)?;
    }
    if spec.supports_ranges {
        easy.range(&format!("{}-{}", resume_offset, spec.end))
            .map_err(curl_err)?;
    }

    // Hard cap on what this worker may write; bytes past it belong to a
    // sibling segment.
    let range_len = spec.end + 1 - resume_offset;

    let status = Arc::new(AtomicU32::new(0));
    let written = Arc::new(AtomicU64::new(0));
    let overflow = Arc::new(AtomicBool::new(false));
    let storage_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));

    {
        let status_hdr = Arc::clone(&status);
        let status_wr = Arc::clone(&status);
        let written_cb = Arc::clone(&written);
        let overflow_cb = Arc::clone(&overflow);
        let storage_error_cb = Arc::clone(&storage_error);
        let cancel_cb = cancel.clone();
        let file_cb = file.clone();
        let tx_cb = tx.clone();
        let segment_key = spec.segment_key.clone();

        let mut handle = easy.transfer();
        handle
            .header_function(move |data| {
                if let Some(code) = parse_status_line(data) {
                    status_hdr.store(code, Ordering::Relaxed);
                }
                true
            })
            .map_err(curl_err)?;
        handle
            .write_function(move |data| {
                if cancel_cb.is_cancelled() {
                    return Ok(0);
                }
                // Only 200/206 bodies are payload; refusing the write aborts
                // the transfer before an error page can reach the file.
                let code = status_wr.load(Ordering::Relaxed);
                if code != 200 && code != 206 {
                    return Ok(0);
                }
                let off = written_cb.fetch_add(data.len() as u64, Ordering::Relaxed);
                // A reply longer than the requested range never reaches the
                // file; the overflowing chunk aborts the transfer instead.
                if off + data.len() as u64 > range_len {
                    overflow_cb.store(true, Ordering::Relaxed);
                    return Ok(0);
                }
                if let Err(e) = file_cb.write_at(resume_offset + off, data) {
                    let _ = storage_error_cb.lock().unwrap().replace(e);
                    return Ok(0);
                }
                let transferred = base_transferred + off + data.len() as u64;
                let _ = tx_cb.send(WorkerEvent::Progress {
                    segment_key: segment_key.clone(),
                    transferred,
                });
                Ok(data.len())
            })
            .map_err(curl_err)?;

        if let Err(e) = handle.perform() {
            if cancel.is_cancelled() {
                return Err(Outcome::Cancelled);
            }
            if e.is_write_error() {
                if overflow.load(Ordering::Relaxed) {
                    return Err(Outcome::Failed(DownloadError::Transport(
                        "server replied with more bytes than the requested range".to_string(),
                    )));
                }
                if let Some(io) = storage_error.lock().unwrap().take() {
                    return Err(Outcome::Failed(DownloadError::Io(io)));
                }
                // Write refused because of a non-2xx status; fall through to
                // the status check below for the real cause.
            } else {
                return Err(Outcome::Failed(DownloadError::Transport(e.to_string())));
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Outcome::Cancelled);
    }

    let code = easy.response_code().map_err(curl_err)?;
    if code != 200 && code != 206 {
        return Err(Outcome::Failed(DownloadError::Transport(format!(
            "unsupported response status: {code}"
        ))));
    }

    Ok(())
}

/// Extracts the status code from an `HTTP/x.y NNN ...` status line.
fn parse_status_line(data: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(data).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
