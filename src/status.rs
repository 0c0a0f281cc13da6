//! Job lifecycle states and their stable database string forms.

/// Lifecycle state of a job.
///
/// Jobs are created in `None`. Admission moves them to `Preparing` then
/// `Downloading`, or parks them in `Waiting` when the concurrency cap is
/// reached. `Completed` and `Removed` are terminal; `Paused` can be resumed;
/// `Error`/`Retrying` jobs may be re-admitted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    #[default]
    None,
    Preparing,
    Downloading,
    Waiting,
    Paused,
    Completed,
    Error,
    Removed,
    Retrying,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::None => "none",
            DownloadStatus::Preparing => "preparing",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Waiting => "waiting",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Removed => "removed",
            DownloadStatus::Retrying => "retrying",
        }
    }

    /// Unknown strings map to `Error` so a corrupt row is never mistaken
    /// for a finished job.
    pub fn from_str(s: &str) -> Self {
        match s {
            "none" => DownloadStatus::None,
            "preparing" => DownloadStatus::Preparing,
            "downloading" => DownloadStatus::Downloading,
            "waiting" => DownloadStatus::Waiting,
            "paused" => DownloadStatus::Paused,
            "completed" => DownloadStatus::Completed,
            "removed" => DownloadStatus::Removed,
            "retrying" => DownloadStatus::Retrying,
            _ => DownloadStatus::Error,
        }
    }

    /// Terminal states cannot be forced to `Paused` by pause/stop_all.
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Removed)
    }
}
