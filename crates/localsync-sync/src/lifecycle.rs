//! Task lifecycle manager
//!
//! Every long-running loop of the engine, and every facade operation, is
//! registered here. `close()` cancels the shared token and waits for all
//! registered jobs and cleaners; `open()` starts a fresh scope.
//!
//! ## Invariant
//!
//! No job registered before a `close()` call is still pending once that
//! call resolves. Jobs receive the scope's [`CancellationToken`] and must
//! observe it at their suspension points.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use futures_util::future::{join, join_all, BoxFuture};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Errors returned when registering work
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The manager is closed (or closing); nothing can be registered
    #[error("task manager is closed; rejected job '{0}'")]
    Closed(String),
}

type Cleaner = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Scope {
    token: CancellationToken,
    tracker: TaskTracker,
    cleaners: Vec<(String, Cleaner)>,
    closed: bool,
}

impl Scope {
    fn fresh() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            cleaners: Vec::new(),
            closed: false,
        }
    }
}

// ============================================================================
// T201: TaskManager
// ============================================================================

/// Registry of cancellable jobs sharing one termination signal
pub struct TaskManager {
    name: String,
    scope: Mutex<Scope>,
}

impl TaskManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Mutex::new(Scope::fresh()),
        }
    }

    fn scope(&self) -> MutexGuard<'_, Scope> {
        self.scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true while jobs can be registered
    pub fn is_open(&self) -> bool {
        !self.scope().closed
    }

    /// Token of the current scope
    pub fn token(&self) -> CancellationToken {
        self.scope().token.clone()
    }

    // ------------------------------------------------------------------------
    // T202: add / run
    // ------------------------------------------------------------------------

    /// Spawns `job` as a tracked task
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Closed` if the manager is closed.
    pub fn add<F, Fut, T>(&self, label: &str, job: F) -> Result<JoinHandle<T>, LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let scope = self.scope();
        if scope.closed {
            return Err(LifecycleError::Closed(label.to_string()));
        }
        debug!(manager = %self.name, job = label, "Spawning job");
        Ok(scope.tracker.spawn(job(scope.token.clone())))
    }

    /// Runs `job` in place while tracking it, so `close()` waits for it
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Closed` if the manager is closed.
    pub async fn run<F, Fut, T>(&self, label: &str, job: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let (tracked, token) = {
            let scope = self.scope();
            if scope.closed {
                return Err(LifecycleError::Closed(label.to_string()));
            }
            (scope.tracker.token(), scope.token.clone())
        };
        let result = job(token).await;
        drop(tracked);
        Ok(result)
    }

    /// Registers teardown-only work executed by the next `close()`
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Closed` if the manager is closed.
    pub fn add_cleaner<F, Fut>(&self, label: &str, cleaner: F) -> Result<(), LifecycleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut scope = self.scope();
        if scope.closed {
            return Err(LifecycleError::Closed(label.to_string()));
        }
        scope
            .cleaners
            .push((label.to_string(), Box::new(move || Box::pin(cleaner()))));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // T203: close / open
    // ------------------------------------------------------------------------

    /// Cancels every job and waits for jobs and cleaners to settle
    pub async fn close(&self) {
        let (token, tracker, cleaners) = {
            let mut scope = self.scope();
            scope.closed = true;
            (
                scope.token.clone(),
                scope.tracker.clone(),
                std::mem::take(&mut scope.cleaners),
            )
        };

        info!(manager = %self.name, jobs = tracker.len(), "Closing task manager");
        token.cancel();
        tracker.close();

        let cleaners = join_all(cleaners.into_iter().map(|(label, cleaner)| async move {
            debug!(job = %label, "Running cleaner");
            cleaner().await;
        }));
        join(cleaners, tracker.wait()).await;

        debug!(manager = %self.name, "Task manager closed");
    }

    /// Starts a fresh scope after `close()`; no-op while open
    pub fn open(&self) {
        let mut scope = self.scope();
        if scope.closed {
            *scope = Scope::fresh();
            debug!(manager = %self.name, "Task manager reopened");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_close_waits_for_cancelled_jobs() {
        let manager = TaskManager::new("test");
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = finished.clone();
            manager
                .add("sleeper", move |token| async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        manager.close().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_jobs_until_reopened() {
        let manager = TaskManager::new("test");
        manager.close().await;

        let err = manager.add("late", |_| async {}).unwrap_err();
        assert_eq!(err, LifecycleError::Closed("late".into()));
        assert!(manager.run("late", |_| async {}).await.is_err());
        assert!(manager.add_cleaner("late", || async {}).is_err());

        manager.open();
        assert!(manager.is_open());
        let handle = manager.add("fresh", |_| async { 7 }).unwrap();
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cleaners_run_on_close() {
        let manager = TaskManager::new("test");
        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = cleaned.clone();
        manager
            .add_cleaner("cleanup", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        manager.close().await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        // Cleaners belong to the closed scope
        manager.open();
        manager.close().await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_is_awaited_by_close() {
        let manager = Arc::new(TaskManager::new("test"));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .run("inline", |token| async move {
                        let _ = started_tx.send(());
                        token.cancelled().await;
                        "done"
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        manager.close().await;
        assert_eq!(runner.await.unwrap().unwrap(), "done");
    }
}
