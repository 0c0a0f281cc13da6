//! Admission control and task supervision.
//!
//! A single dispatch loop owns the intake queue, the job arena and the set
//! of running tasks. At most `all_download_threads / each_download_threads`
//! jobs run concurrently; excess admissions wait in the queue with status
//! `Waiting` and are promoted one per freed slot. Only the component holding
//! a job's execution slot mutates it: at rest that is this loop (via the
//! arena), while a running job belongs to its task until the task hands it
//! back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::config::DownloadConfig;
use crate::control::TaskControl;
use crate::error::DownloadError;
use crate::job::Job;
use crate::status::DownloadStatus;
use crate::task::{DownloadTask, TaskMsg, TaskOutcome};

/// Intake queue bound; admissions beyond this are rejected with a warning.
const INTAKE_CAPACITY: usize = 50;

/// Commands from the engine facade.
#[derive(Debug)]
pub(crate) enum Command {
    Admit(Job),
    /// Park a recovered job in the arena without starting it. Used once at
    /// startup for jobs reloaded from the store.
    Restore(Job),
    Pause(String),
    Resume(String),
    Remove(String),
    /// Cancel everything, park each job as `Paused`, then acknowledge.
    StopAll(oneshot::Sender<()>),
}

/// Reports to the engine: bridged to caller events and checkpoints.
#[derive(Debug)]
pub(crate) enum Report {
    Started(Job),
    Progress(Job),
    /// Concurrency cap reached; checkpointed but not surfaced to the caller.
    Waiting(Job),
    Paused(Job),
    Removed(Job),
    Succeeded(Job),
    Failed(Job, DownloadError),
}

/// What was requested of a running task while it was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    None,
    Pause,
    Remove,
}

pub(crate) struct Scheduler {
    config: DownloadConfig,
    cap: usize,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    reports: mpsc::UnboundedSender<Report>,
    task_tx: mpsc::UnboundedSender<TaskMsg>,
    task_rx: mpsc::UnboundedReceiver<TaskMsg>,
    control: Arc<TaskControl>,
    /// Keys of admitted jobs not yet running, in admission order.
    queue: VecDeque<String>,
    /// Every known job that is not currently running.
    arena: HashMap<String, Job>,
    running: HashMap<String, PendingAction>,
    tasks: JoinSet<(Job, TaskOutcome)>,
    stop_ack: Option<oneshot::Sender<()>>,
}

impl Scheduler {
    pub(crate) fn new(
        config: DownloadConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        reports: mpsc::UnboundedSender<Report>,
    ) -> Self {
        let cap = config.max_active_jobs();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        Self {
            config,
            cap,
            cmd_rx,
            reports,
            task_tx,
            task_rx,
            control: Arc::new(TaskControl::new()),
            queue: VecDeque::new(),
            arena: HashMap::new(),
            running: HashMap::new(),
            tasks: JoinSet::new(),
            stop_ack: None,
        }
    }

    /// Dispatch loop. Ends when the engine drops its command handle and no
    /// task is left running.
    pub(crate) async fn run(mut self) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                Some(msg) = self.task_rx.recv() => self.on_task_msg(msg),
                cmd = self.cmd_rx.recv(), if commands_open => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        commands_open = false;
                        self.control.cancel_all();
                    }
                },
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_task_finished(res);
                }
                else => break,
            }
            if !commands_open && self.tasks.is_empty() {
                break;
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Admit(job) => self.admit(job),
            Command::Restore(job) => self.restore(job),
            Command::Pause(key) => self.pause(&key),
            Command::Resume(key) => self.resume(&key),
            Command::Remove(key) => self.remove(&key),
            Command::StopAll(ack) => self.stop_all(ack),
        }
    }

    /// Idempotent submission: a job already queued or running is a no-op.
    fn admit(&mut self, job: Job) {
        let key = job.key.clone();
        if self.running.contains_key(&key) || self.queue.contains(&key) {
            tracing::debug!(job = %key, "already queued or running, ignoring admit");
            return;
        }
        if self.queue.len() >= INTAKE_CAPACITY {
            tracing::warn!(job = %key, "intake queue full, rejecting admission");
            return;
        }

        // A known identity re-admits its existing state (resume semantics);
        // only an unknown one takes the caller's fresh job.
        let entry = self.arena.entry(key.clone()).or_insert(job);
        if entry.status == DownloadStatus::Completed {
            // Same caller surface as a fresh identity whose file already
            // verifies: success is reported, not swallowed.
            tracing::debug!(job = %key, "already completed, reporting success");
            let _ = self.reports.send(Report::Succeeded(entry.clone()));
            return;
        }
        entry.status = DownloadStatus::None;
        self.queue.push_back(key);
        self.drain_queue();
    }

    /// Recovered jobs park as paused; nothing was actually running when the
    /// previous process died, whatever status the store recorded.
    fn restore(&mut self, mut job: Job) {
        if self.arena.contains_key(&job.key) {
            return;
        }
        if !job.status.is_terminal() {
            job.status = DownloadStatus::Paused;
        }
        tracing::debug!(job = %job.key, progress = job.progress, "restored job from store");
        self.arena.insert(job.key.clone(), job);
    }

    fn pause(&mut self, key: &str) {
        if let Some(pending) = self.running.get_mut(key) {
            // Remove wins over pause; anything else downgrades to pause.
            if *pending != PendingAction::Remove {
                *pending = PendingAction::Pause;
            }
            self.control.request_cancel(key);
            return;
        }
        if let Some(pos) = self.queue.iter().position(|k| k == key) {
            self.queue.remove(pos);
        }
        if let Some(job) = self.arena.get_mut(key) {
            if !job.status.is_terminal() {
                job.status = DownloadStatus::Paused;
                job.touch();
                let _ = self.reports.send(Report::Paused(job.clone()));
            }
        }
    }

    /// Re-admission through the same path as a fresh start, progress intact.
    fn resume(&mut self, key: &str) {
        if self.running.contains_key(key) || self.queue.contains(&key.to_string()) {
            return;
        }
        match self.arena.get(key) {
            Some(job) if !job.status.is_terminal() => {
                let job = job.clone();
                self.admit(job);
            }
            _ => tracing::debug!(job = %key, "resume for unknown or terminal job ignored"),
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(pending) = self.running.get_mut(key) {
            *pending = PendingAction::Remove;
            self.control.request_cancel(key);
            return;
        }
        if let Some(pos) = self.queue.iter().position(|k| k == key) {
            self.queue.remove(pos);
        }
        match self.arena.remove(key) {
            Some(job) => self.finish_remove(job),
            None => tracing::debug!(job = %key, "remove for unknown job ignored"),
        }
    }

    /// Removal is final: the destination file goes away and the identity may
    /// only come back as a fresh start.
    fn finish_remove(&mut self, mut job: Job) {
        if job.save_path.exists() {
            if let Err(e) = std::fs::remove_file(&job.save_path) {
                tracing::warn!(job = %job.key, %e, "failed to delete destination file");
            }
        }
        job.status = DownloadStatus::Removed;
        job.touch();
        let _ = self.reports.send(Report::Removed(job));
    }

    fn stop_all(&mut self, ack: oneshot::Sender<()>) {
        tracing::info!("stopping all downloads");
        for pending in self.running.values_mut() {
            if *pending == PendingAction::None {
                *pending = PendingAction::Pause;
            }
        }
        self.control.cancel_all();

        while let Some(key) = self.queue.pop_front() {
            if let Some(job) = self.arena.get_mut(&key) {
                if !job.status.is_terminal() {
                    job.status = DownloadStatus::Paused;
                    job.touch();
                    let _ = self.reports.send(Report::Paused(job.clone()));
                }
            }
        }

        if self.running.is_empty() {
            let _ = ack.send(());
        } else {
            self.stop_ack = Some(ack);
        }
    }

    fn on_task_msg(&mut self, msg: TaskMsg) {
        match msg {
            TaskMsg::Started(job) => {
                let _ = self.reports.send(Report::Started(job));
            }
            TaskMsg::Progress(job) => {
                let _ = self.reports.send(Report::Progress(job));
            }
        }
    }

    fn on_task_finished(
        &mut self,
        res: Result<(Job, TaskOutcome), tokio::task::JoinError>,
    ) {
        let (mut job, outcome) = match res {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(%e, "download task aborted unexpectedly");
                self.after_task_finished();
                return;
            }
        };

        let pending = self
            .running
            .remove(&job.key)
            .unwrap_or(PendingAction::None);
        self.control.unregister(&job.key);

        if pending == PendingAction::Remove {
            self.finish_remove(job);
            self.after_task_finished();
            return;
        }

        match outcome {
            TaskOutcome::Completed => {
                let _ = self.reports.send(Report::Succeeded(job.clone()));
                self.arena.insert(job.key.clone(), job);
            }
            TaskOutcome::Failed(error) => {
                let _ = self.reports.send(Report::Failed(job.clone(), error));
                self.arena.insert(job.key.clone(), job);
            }
            TaskOutcome::Cancelled => {
                // Pause requested, or shutdown; either way the job parks as
                // paused with its progress intact.
                job.status = DownloadStatus::Paused;
                job.touch();
                let _ = self.reports.send(Report::Paused(job.clone()));
                self.arena.insert(job.key.clone(), job);
            }
        }

        self.after_task_finished();
    }

    fn after_task_finished(&mut self) {
        if self.running.is_empty() {
            if let Some(ack) = self.stop_ack.take() {
                let _ = ack.send(());
                return;
            }
        }
        if self.stop_ack.is_none() {
            self.drain_queue();
        }
    }

    /// Starts queued jobs while slots are free; everything left over is
    /// marked `Waiting` for the next freed slot.
    fn drain_queue(&mut self) {
        while self.running.len() < self.cap {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            let Some(mut job) = self.arena.remove(&key) else {
                continue;
            };
            job.status = DownloadStatus::Preparing;
            job.touch();

            let cancel = self.control.register(&key);
            let task = DownloadTask::new(
                job,
                self.config.clone(),
                cancel,
                self.task_tx.clone(),
            );
            self.running.insert(key, PendingAction::None);
            self.tasks.spawn_blocking(move || task.run());
        }

        for key in &self.queue {
            if let Some(job) = self.arena.get_mut(key) {
                if job.status != DownloadStatus::Waiting {
                    job.status = DownloadStatus::Waiting;
                    job.touch();
                    let _ = self.reports.send(Report::Waiting(job.clone()));
                }
            }
        }
    }
}
