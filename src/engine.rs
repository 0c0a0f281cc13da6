//! Public facade over the scheduler and the job store.
//!
//! `Engine::new` spawns the scheduler dispatch loop and an event pump that
//! checkpoints every report to the store before forwarding it to the caller.
//! Startup recovery runs first: unfinished jobs are reloaded from the store
//! and parked as paused, then the engine turns ready and mutating calls are
//! accepted. `destroy` is the mirror image: cancel everything, wait for the
//! running tasks to park, close the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::event::DownloadEvent;
use crate::job::Job;
use crate::scheduler::{Command, Report, Scheduler};
use crate::state_db::StateDb;

/// Handle to one running download engine. Cheap to clone; all clones share
/// the same scheduler and store.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    flush: mpsc::UnboundedSender<oneshot::Sender<()>>,
    ready: Arc<AtomicBool>,
    db: StateDb,
}

impl Engine {
    /// Builds an engine on the given store and returns it together with the
    /// caller's event stream. Recovery happens before this returns, so the
    /// first event on the stream is always `Ready`.
    pub async fn new(
        config: DownloadConfig,
        db: StateDb,
    ) -> Result<(Engine, mpsc::UnboundedReceiver<DownloadEvent>)> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler::new(config, cmd_rx, report_tx);
        tokio::spawn(scheduler.run());
        tokio::spawn(event_pump(report_rx, flush_rx, event_tx.clone(), db.clone()));

        let recovered = db.load_unfinished().await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "recovered unfinished jobs");
        }
        for job in recovered {
            let _ = cmd_tx.send(Command::Restore(job));
        }

        let ready = Arc::new(AtomicBool::new(true));
        let _ = event_tx.send(DownloadEvent::Ready);

        Ok((
            Engine {
                commands: cmd_tx,
                flush: flush_tx,
                ready,
                db,
            },
            event_rx,
        ))
    }

    /// Convenience constructor using the default XDG store location.
    pub async fn with_default_store(
        config: DownloadConfig,
    ) -> Result<(Engine, mpsc::UnboundedReceiver<DownloadEvent>)> {
        let db = StateDb::open_default().await?;
        Self::new(config, db).await
    }

    fn check_ready(&self) -> Result<(), DownloadError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DownloadError::NotReady)
        }
    }

    fn send(&self, cmd: Command) -> Result<(), DownloadError> {
        self.check_ready()?;
        self.commands
            .send(cmd)
            .map_err(|_| DownloadError::NotReady)
    }

    /// Submits a job for download. Idempotent while the job is queued or
    /// running; a known identity resumes from its persisted progress.
    pub fn start(&self, job: Job) -> Result<(), DownloadError> {
        self.send(Command::Admit(job))
    }

    /// Requests a pause. Running segment workers stop at the next chunk
    /// boundary; the `Paused` event arrives once the state is persisted.
    pub fn pause(&self, key: impl Into<String>) -> Result<(), DownloadError> {
        self.send(Command::Pause(key.into()))
    }

    /// Resumes a previously paused or failed job from its recorded offsets.
    pub fn resume(&self, key: impl Into<String>) -> Result<(), DownloadError> {
        self.send(Command::Resume(key.into()))
    }

    /// Removes a job: cancels it if running, deletes the destination file
    /// and the persisted state. The identity may be reused afterwards as a
    /// fresh start.
    pub fn remove(&self, key: impl Into<String>) -> Result<(), DownloadError> {
        self.send(Command::Remove(key.into()))
    }

    /// Orderly shutdown: cancels every running task, waits for each to park
    /// as paused with its checkpoint written, then closes the store. Further
    /// mutating calls fail with `NotReady`.
    pub async fn destroy(&self) {
        if !self.ready.swap(false, Ordering::SeqCst) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::StopAll(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        // The final Paused/Removed reports are queued ahead of the ack;
        // their checkpoints must hit the store before it goes away.
        let (flushed_tx, flushed_rx) = oneshot::channel();
        if self.flush.send(flushed_tx).is_ok() {
            let _ = flushed_rx.await;
        }
        self.db.close().await;
        tracing::info!("engine destroyed");
    }
}

/// Bridges scheduler reports to the caller's event stream, writing each
/// job snapshot through to the store first so a crash after the event was
/// observed never loses more than the most recent chunk. A flush request
/// drains every report already queued before acknowledging, so `destroy`
/// can hold the store open until the last checkpoint has landed.
async fn event_pump(
    mut reports: mpsc::UnboundedReceiver<Report>,
    mut flush: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<DownloadEvent>,
    db: StateDb,
) {
    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Some(report) => apply_report(&db, &events, report).await,
                None => break,
            },
            Some(done) = flush.recv() => {
                while let Ok(report) = reports.try_recv() {
                    apply_report(&db, &events, report).await;
                }
                let _ = done.send(());
            }
        }
    }
}

async fn apply_report(
    db: &StateDb,
    events: &mpsc::UnboundedSender<DownloadEvent>,
    report: Report,
) {
    match report {
        Report::Started(job) => {
            checkpoint(db, &job).await;
            let _ = events.send(DownloadEvent::Started(job));
        }
        Report::Progress(job) => {
            checkpoint(db, &job).await;
            let _ = events.send(DownloadEvent::Progress(job));
        }
        Report::Waiting(job) => {
            // Queued-state checkpoint only; not part of the caller surface.
            checkpoint(db, &job).await;
        }
        Report::Paused(job) => {
            checkpoint(db, &job).await;
            let _ = events.send(DownloadEvent::Paused(job));
        }
        Report::Removed(job) => {
            if let Err(e) = db.delete_job(&job.key).await {
                tracing::warn!(job = %job.key, %e, "failed to delete job state");
            }
            let _ = events.send(DownloadEvent::Removed(job));
        }
        Report::Succeeded(job) => {
            checkpoint(db, &job).await;
            let _ = events.send(DownloadEvent::Succeeded(job));
        }
        Report::Failed(job, error) => {
            checkpoint(db, &job).await;
            let _ = events.send(DownloadEvent::Failed(job, error));
        }
    }
}

async fn checkpoint(db: &StateDb, job: &Job) {
    if let Err(e) = db.upsert_job(job).await {
        tracing::warn!(job = %job.key, %e, "failed to checkpoint job");
        return;
    }
    for segment in job.segments.values() {
        if let Err(e) = db.upsert_segment(segment).await {
            tracing::warn!(segment = %segment.key, %e, "failed to checkpoint segment");
        }
    }
}
