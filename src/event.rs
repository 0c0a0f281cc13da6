//! Events the engine emits to its caller.
//!
//! The listener surface is a tagged union delivered over a channel; events
//! for one job arrive in the order its status changed, with at most one
//! terminal event per run.

use crate::error::DownloadError;
use crate::job::Job;

/// Caller-facing event stream. Each variant except `Ready` carries a
/// snapshot of the job at the moment the event was produced.
#[derive(Debug)]
pub enum DownloadEvent {
    /// Startup recovery finished; mutating calls are accepted from now on.
    Ready,
    /// A task passed admission and its segment workers are running.
    Started(Job),
    /// Throttled progress update; the final 100% update is never dropped.
    Progress(Job),
    /// The job was paused (explicitly or by shutdown) with state persisted.
    Paused(Job),
    /// The job and its persisted state were removed.
    Removed(Job),
    /// The finished file passed the checksum gate.
    Succeeded(Job),
    /// Terminal failure for this run; never silently dropped.
    Failed(Job, DownloadError),
}

impl DownloadEvent {
    /// Job key this event is about, if any.
    pub fn job_key(&self) -> Option<&str> {
        match self {
            DownloadEvent::Ready => None,
            DownloadEvent::Started(j)
            | DownloadEvent::Progress(j)
            | DownloadEvent::Paused(j)
            | DownloadEvent::Removed(j)
            | DownloadEvent::Succeeded(j)
            | DownloadEvent::Failed(j, _) => Some(&j.key),
        }
    }
}
