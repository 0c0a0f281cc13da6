//! Download task: drives exactly one job from admission to a terminal
//! outcome.
//!
//! The task owns its `Job` by value for the whole run and hands it back to
//! the scheduler together with the outcome, so no two components ever
//! mutate job state concurrently. `run` is fully blocking and is executed
//! under `spawn_blocking`; the initial probe deliberately blocks the worker
//! that runs it, which serializes a job's startup without stalling other
//! jobs.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::DownloadConfig;
use crate::control::CancelToken;
use crate::error::DownloadError;
use crate::job::{Job, Segment};
use crate::partition;
use crate::probe;
use crate::status::DownloadStatus;
use crate::storage::JobFile;
use crate::worker::{self, SegmentSpec, WorkerEvent};

/// Minimum gap between two progress notifications for one job. The final
/// 100% update bypasses the throttle.
const PROGRESS_NOTIFY_INTERVAL: Duration = Duration::from_secs(2);

/// Messages a running task sends to the engine while it is alive.
#[derive(Debug)]
pub(crate) enum TaskMsg {
    /// Probe and partitioning succeeded; segment workers are running.
    Started(Job),
    /// Throttled progress snapshot.
    Progress(Job),
}

/// How a task run ended.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    /// File complete and past the checksum gate; status is `Completed`.
    Completed,
    /// Terminal failure for this run; status is `Error` or `Retrying`.
    Failed(DownloadError),
    /// Cancelled cooperatively (pause/remove/shutdown); the scheduler
    /// decides the final status.
    Cancelled,
}

pub(crate) struct DownloadTask {
    job: Job,
    config: DownloadConfig,
    cancel: CancelToken,
    updates: UnboundedSender<TaskMsg>,
}

enum Prepared {
    /// Destination already matches the expected checksum.
    AlreadyComplete,
    /// Probe done, counters consistent; ready to partition and transfer.
    Transfer,
}

impl DownloadTask {
    pub(crate) fn new(
        job: Job,
        config: DownloadConfig,
        cancel: CancelToken,
        updates: UnboundedSender<TaskMsg>,
    ) -> Self {
        Self {
            job,
            config,
            cancel,
            updates,
        }
    }

    /// Runs the job to a terminal outcome and returns the job with its
    /// final in-memory state.
    pub(crate) fn run(mut self) -> (Job, TaskOutcome) {
        match self.prepare() {
            Ok(Prepared::AlreadyComplete) => {
                self.job.status = DownloadStatus::Completed;
                if let Some(size) = self.job.size {
                    self.job.progress = size;
                }
                self.job.touch();
                tracing::info!(job = %self.job.key, "destination already verified, skipping transfer");
                (self.job, TaskOutcome::Completed)
            }
            Ok(Prepared::Transfer) => self.download(),
            Err(e) => {
                self.job.status = DownloadStatus::Error;
                self.job.touch();
                (self.job, TaskOutcome::Failed(e))
            }
        }
    }

    fn prepare(&mut self) -> Result<Prepared, DownloadError> {
        // Cheap idempotent re-entry: a file that already verifies needs no
        // transfer and no probe at all.
        if let Some(expected) = self.job.checksum.clone() {
            if self.job.save_path.exists() {
                if let Ok(actual) = crate::checksum::md5_path(&self.job.save_path) {
                    if actual == expected {
                        if self.job.size.is_none() {
                            self.job.size = std::fs::metadata(&self.job.save_path)
                                .map(|m| m.len())
                                .ok();
                        }
                        return Ok(Prepared::AlreadyComplete);
                    }
                }
            }
        }

        if self.job.size.is_none() {
            let result = probe::probe(&self.job.url, &self.config)?;
            self.job.size = Some(result.size);
            self.job.supports_ranges = result.supports_ranges;
            tracing::debug!(
                job = %self.job.key,
                size = result.size,
                supports_ranges = result.supports_ranges,
                "probe complete"
            );
        }

        let size = self.job.size.unwrap_or(0);
        if size == 0 {
            return Err(DownloadError::RemoteFile(format!(
                "file ({}) has no content",
                self.job.url
            )));
        }

        // A previous run may have died between the checkpoint and the file
        // write. If recorded progress outruns what is actually on disk, the
        // local state is untrustworthy: start over from zero.
        if self.job.progress > 0 {
            let disk_len = std::fs::metadata(&self.job.save_path).map(|m| m.len());
            let consistent = matches!(&disk_len, Ok(len) if *len >= self.job.progress);
            if !consistent {
                tracing::warn!(
                    job = %self.job.key,
                    progress = self.job.progress,
                    "partial file inconsistent with recorded progress, resetting"
                );
                if self.job.save_path.exists() {
                    std::fs::remove_file(&self.job.save_path)?;
                }
                self.job.progress = 0;
                for segment in self.job.segments.values_mut() {
                    segment.transferred = 0;
                }
            }
        }

        Ok(Prepared::Transfer)
    }

    fn download(mut self) -> (Job, TaskOutcome) {
        let size = self.job.size.expect("size resolved in prepare");
        let threads = if self.job.supports_ranges {
            self.config.each_download_threads
        } else {
            1
        };

        // Deterministic segment keys let a resumed run pick up the prior
        // transferred counts for unchanged ranges.
        let plan = partition::plan_segments(size, threads);
        let mut segments = HashMap::with_capacity(plan.len());
        for (i, range) in plan.iter().enumerate() {
            let key = Segment::key_for(&self.job.save_path, i + 1);
            let transferred = if self.job.supports_ranges {
                self.job
                    .segments
                    .get(&key)
                    .filter(|s| s.start == range.start && s.end == range.end)
                    .map(|s| s.transferred.min(range.len()))
                    .unwrap_or(0)
            } else {
                // Full-body replay always restarts at offset zero.
                0
            };
            segments.insert(
                key.clone(),
                Segment {
                    job_key: self.job.key.clone(),
                    key,
                    start: range.start,
                    end: range.end,
                    transferred,
                },
            );
        }
        self.job.segments = segments;
        self.job.recompute_progress();
        self.job.status = DownloadStatus::Downloading;
        self.job.touch();
        let _ = self.updates.send(TaskMsg::Started(self.job.clone()));

        let file = match JobFile::open(&self.job.save_path, size) {
            Ok(f) => f,
            Err(e) => {
                self.job.status = DownloadStatus::Error;
                self.job.touch();
                let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                return (self.job, TaskOutcome::Failed(DownloadError::Io(io)));
            }
        };

        let (tx, rx) = mpsc::channel::<WorkerEvent>();
        let mut handles = Vec::new();
        for segment in self.job.segments.values() {
            if segment.transferred >= segment.len() {
                continue;
            }
            let spec = SegmentSpec {
                url: self.job.url.clone(),
                segment_key: segment.key.clone(),
                start: segment.start,
                end: segment.end,
                transferred: segment.transferred,
                supports_ranges: self.job.supports_ranges,
            };
            let file = file.clone();
            let cancel = self.cancel.clone();
            let config = self.config.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                worker::run_segment(spec, file, cancel, &config, tx)
            }));
        }
        // The aggregation loop ends when the last worker drops its sender.
        drop(tx);

        let mut failure: Option<DownloadError> = None;
        let mut last_notify: Option<Instant> = None;
        while let Ok(event) = rx.recv() {
            match event {
                WorkerEvent::Progress {
                    segment_key,
                    transferred,
                } => {
                    if let Some(segment) = self.job.segments.get_mut(&segment_key) {
                        segment.transferred = transferred;
                    }
                    let progress = self.job.recompute_progress();
                    self.job.touch();
                    let complete = progress == size;
                    let due = last_notify
                        .map(|t| t.elapsed() >= PROGRESS_NOTIFY_INTERVAL)
                        .unwrap_or(true);
                    if complete || due {
                        last_notify = Some(Instant::now());
                        let _ = self.updates.send(TaskMsg::Progress(self.job.clone()));
                    }
                }
                WorkerEvent::Done { segment_key } => {
                    tracing::debug!(job = %self.job.key, segment = %segment_key, "segment done");
                }
                WorkerEvent::Failed { segment_key, error } => {
                    tracing::warn!(job = %self.job.key, segment = %segment_key, %error, "segment failed");
                    if failure.is_none() {
                        failure = Some(error);
                        // Stop the siblings too: their progress is already
                        // recorded, and a later resume continues from it.
                        self.cancel.cancel();
                    }
                }
            }
        }
        for handle in handles {
            let _ = handle.join();
        }

        if let Some(error) = failure {
            self.job.status = DownloadStatus::Error;
            self.job.retry_count += 1;
            self.job.touch();
            return (self.job, TaskOutcome::Failed(error));
        }

        if self.cancel.is_cancelled() {
            self.job.touch();
            return (self.job, TaskOutcome::Cancelled);
        }

        let _ = file.sync();
        self.finish(size)
    }

    /// All workers exhausted their streams without failure: gate on the
    /// aggregated byte count and the checksum before claiming success.
    fn finish(mut self, size: u64) -> (Job, TaskOutcome) {
        if self.job.progress < size {
            self.job.status = DownloadStatus::Error;
            self.job.retry_count += 1;
            self.job.touch();
            return (
                self.job,
                TaskOutcome::Failed(DownloadError::Transport(
                    "transfer ended before the file was complete".to_string(),
                )),
            );
        }

        if self.job.progress > size {
            // Bug guard: an aggregate beyond the file size is corruption,
            // never success.
            return self.fail_corrupt(DownloadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "aggregated progress exceeds file size",
            )));
        }

        if let Some(expected) = self.job.checksum.clone() {
            let actual = match crate::checksum::md5_path(&self.job.save_path) {
                Ok(digest) => digest,
                Err(e) => {
                    self.job.status = DownloadStatus::Error;
                    self.job.touch();
                    let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                    return (self.job, TaskOutcome::Failed(DownloadError::Io(io)));
                }
            };
            if actual != expected {
                return self.fail_corrupt(DownloadError::ChecksumMismatch { expected, actual });
            }
        }

        self.job.status = DownloadStatus::Completed;
        self.job.touch();
        tracing::info!(job = %self.job.key, size, "download complete and verified");
        (self.job, TaskOutcome::Completed)
    }

    /// Checksum mismatch or progress overrun: delete the corrupt file so the
    /// next start begins from a clean state, then report the failure.
    fn fail_corrupt(mut self, error: DownloadError) -> (Job, TaskOutcome) {
        if self.job.save_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.job.save_path) {
                tracing::warn!(job = %self.job.key, %e, "failed to delete corrupt file");
            }
        }
        self.job.status = DownloadStatus::Retrying;
        self.job.retry_count += 1;
        self.job.touch();
        (self.job, TaskOutcome::Failed(error))
    }
}
