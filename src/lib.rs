//! rangeload: a resumable, multi-segment HTTP download engine.
//!
//! Files are fetched in parallel byte-range segments, progress is
//! checkpointed to SQLite so interrupted downloads resume where they left
//! off, and finished files are verified against an optional MD5 checksum.
//! The caller drives everything through [`Engine`] and observes it through
//! the [`DownloadEvent`] stream.

pub mod checksum;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod logging;
pub mod partition;
pub mod probe;
mod scheduler;
pub mod state_db;
pub mod status;
pub mod storage;
mod task;
mod worker;

pub use config::DownloadConfig;
pub use engine::Engine;
pub use error::DownloadError;
pub use event::DownloadEvent;
pub use job::{Job, JobBuilder, Segment};
pub use state_db::StateDb;
pub use status::DownloadStatus;
