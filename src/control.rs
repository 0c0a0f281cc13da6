//! Cooperative cancellation for running tasks.
//!
//! The scheduler registers each admitted job here and hands the token to its
//! task; every segment worker of that job shares the same token. Cancellation
//! is cooperative: a worker inside a blocking read observes the flag on its
//! next write callback and exits on its own path, releasing its connection
//! and file handle itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Shared cancel flag for one job's task and workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of job key -> cancel token for everything currently running.
#[derive(Default)]
pub struct TaskControl {
    tokens: RwLock<HashMap<String, CancelToken>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job about to run; returns the token to pass into its task.
    pub fn register(&self, job_key: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .write()
            .unwrap()
            .insert(job_key.to_string(), token.clone());
        token
    }

    /// Drop a finished job's token (success, failure or cancellation alike).
    pub fn unregister(&self, job_key: &str) {
        self.tokens.write().unwrap().remove(job_key);
    }

    /// Request cancellation of one running job. No-op for unknown keys.
    pub fn request_cancel(&self, job_key: &str) {
        if let Some(token) = self.tokens.read().unwrap().get(job_key) {
            token.cancel();
        }
    }

    /// Request cancellation of every running job (shutdown path).
    pub fn cancel_all(&self) {
        for token in self.tokens.read().unwrap().values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_registered_token() {
        let control = TaskControl::new();
        let token = control.register("job-a");
        assert!(!token.is_cancelled());
        control.request_cancel("job-a");
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_key_is_noop() {
        let control = TaskControl::new();
        let token = control.register("job-a");
        control.request_cancel("job-b");
        assert!(!token.is_cancelled());
    }

    #[test]
    fn unregister_detaches_future_cancels() {
        let control = TaskControl::new();
        let token = control.register("job-a");
        control.unregister("job-a");
        control.request_cancel("job-a");
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_all_hits_every_token() {
        let control = TaskControl::new();
        let a = control.register("a");
        let b = control.register("b");
        control.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
