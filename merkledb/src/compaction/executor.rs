use async_lock::Semaphore;
use commonware_runtime::{Handle, Spawner};
use futures::FutureExt;
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread,
};
use tracing::debug;

static GLOBAL: OnceLock<Arc<Executor>> = OnceLock::new();

/// Bounds the number of compaction tasks running at once, with counters of submitted, started
/// and completed tasks.
pub struct Executor {
    permits: Semaphore,
    threads: usize,
    submitted: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
}

impl Executor {
    /// Create an executor running at most `threads` tasks at a time.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            permits: Semaphore::new(threads),
            threads,
            submitted: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// The process-wide executor, created with `threads` slots by the first caller.
    pub fn global(threads: usize) -> Arc<Self> {
        GLOBAL
            .get_or_init(|| {
                debug!(threads, "initialized compaction executor");
                Arc::new(Self::new(threads))
            })
            .clone()
    }

    /// Maximum number of tasks running at once.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Spawn `task` with `context` once a slot is free, then call `done` with its outcome.
    ///
    /// The task is counted as completed before `done` runs.
    pub fn spawn<S, F, D>(self: &Arc<Self>, context: S, task: F, done: D) -> Handle<()>
    where
        S: Spawner,
        F: Future<Output = ()> + Send + 'static,
        D: FnOnce(thread::Result<()>) + Send + 'static,
    {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        let executor = self.clone();
        context.spawn(move |_| async move {
            let permit = executor.permits.acquire().await;
            executor.started.fetch_add(1, Ordering::AcqRel);
            let result = AssertUnwindSafe(task).catch_unwind().await;
            executor.completed.fetch_add(1, Ordering::AcqRel);
            drop(permit);
            done(result);
        })
    }

    /// Number of tasks ever submitted.
    pub fn task_count(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Number of tasks that finished (successfully or not).
    pub fn completed_task_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Number of tasks submitted but not started.
    pub fn queued(&self) -> u64 {
        let started = self.started.load(Ordering::Acquire);
        self.task_count().saturating_sub(started)
    }

    /// Number of tasks currently running.
    pub fn active(&self) -> u64 {
        let completed = self.completed_task_count();
        self.started.load(Ordering::Acquire).saturating_sub(completed)
    }
}
