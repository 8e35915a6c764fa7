use super::{Compactor, Error, Executor, Gate};
use commonware_runtime::{Clock, Spawner, Storage};
use futures::channel::oneshot;
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, error, info};

/// Counters of finished compactions.
#[derive(Clone, Default)]
pub struct Metrics {
    pub completed: Counter,
    pub interrupted: Counter,
    pub failed: Counter,
    pub merged_files: Counter,
}

type Listener = Box<dyn Fn() + Send + Sync>;

struct Running<E: Storage + Clock> {
    compactors: HashMap<String, Arc<Compactor<E>>>,

    /// Notified once no compaction is left.
    idle: Vec<oneshot::Sender<()>>,
}

/// Schedules the compactions of one table on a shared [Executor], running at most one compaction
/// per store at a time.
pub struct Coordinator<E: Spawner + Storage + Clock> {
    context: E,
    table: String,
    executor: Arc<Executor>,
    gate: Arc<Gate>,
    enabled: AtomicBool,
    running: Arc<Mutex<Running<E>>>,
    metrics: Metrics,
    listener: Arc<Listener>,
}

impl<E: Spawner + Storage + Clock> Coordinator<E> {
    /// Create a coordinator for `table`, spawning compactions with `context`.
    ///
    /// `listener` runs after every compaction, before the compaction is reported as finished.
    pub fn new(
        context: E,
        table: &str,
        executor: Arc<Executor>,
        enabled: bool,
        metrics: Metrics,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            context,
            table: table.to_string(),
            executor,
            gate: Arc::new(Gate::default()),
            enabled: AtomicBool::new(enabled),
            running: Arc::new(Mutex::new(Running {
                compactors: HashMap::new(),
                idle: Vec::new(),
            })),
            metrics,
            listener: Arc::new(Box::new(listener)),
        }
    }

    /// The gate compactors of this table pass before touching indices.
    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    /// The executor running compactions.
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Submit `compactor` unless background compaction is disabled or a compaction of the same
    /// store is already running. Returns true if it was submitted.
    pub fn compact_if_not_running_yet(&self, compactor: Compactor<E>) -> bool {
        let name = compactor.name().to_string();
        let compactor = Arc::new(compactor);
        {
            let mut running = self.running.lock().unwrap();
            if !self.enabled.load(Ordering::Acquire) || running.compactors.contains_key(&name) {
                return false;
            }
            running.compactors.insert(name.clone(), compactor.clone());
        }
        debug!(table = %self.table, store = %name, "submitting compaction");

        let table = self.table.clone();
        let metrics = self.metrics.clone();
        let task = {
            let table = table.clone();
            let metrics = metrics.clone();
            async move {
                match compactor.compact().await {
                    Ok(Some(summary)) => {
                        metrics.completed.inc();
                        metrics.merged_files.inc_by(summary.files as u64);
                    }
                    Ok(None) => {
                        metrics.completed.inc();
                    }
                    Err(Error::Interrupted) => {
                        metrics.interrupted.inc();
                        info!(table = %table, store = compactor.name(), "compaction interrupted");
                    }
                    Err(err) => {
                        metrics.failed.inc();
                        error!(table = %table, store = compactor.name(), ?err, "compaction failed");
                    }
                }
            }
        };
        let running = self.running.clone();
        let listener = self.listener.clone();
        self.executor
            .spawn(self.context.clone(), task, move |result| {
                if result.is_err() {
                    metrics.failed.inc();
                    error!(table = %table, store = %name, "compaction panicked");
                }
                listener();
                let mut running = running.lock().unwrap();
                running.compactors.remove(&name);
                if running.compactors.is_empty() {
                    for waiter in running.idle.drain(..) {
                        let _ = waiter.send(());
                    }
                }
            });
        true
    }

    /// Allow new compactions.
    pub fn enable_background_compaction(&self) {
        let _running = self.running.lock().unwrap();
        self.enabled.store(true, Ordering::Release);
    }

    /// Refuse new compactions, interrupt the running ones, and wait for all of them to finish.
    pub async fn stop_and_disable_background_compaction(&self) {
        let (stopped, idle) = {
            let mut running = self.running.lock().unwrap();
            self.enabled.store(false, Ordering::Release);
            for compactor in running.compactors.values() {
                compactor.interrupt();
            }
            let stopped = running.compactors.len();
            if stopped == 0 {
                (0, None)
            } else {
                let (sender, receiver) = oneshot::channel();
                running.idle.push(sender);
                (stopped, Some(receiver))
            }
        };
        if let Some(idle) = idle {
            let _ = idle.await;
        }
        debug!(table = %self.table, stopped, "stopped background compaction");
    }

    pub fn is_compaction_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns true if a compaction of `store` is running (or queued).
    pub fn is_compaction_running(&self, store: &str) -> bool {
        self.running.lock().unwrap().compactors.contains_key(store)
    }

    /// Number of compactions running (or queued).
    pub fn running(&self) -> usize {
        self.running.lock().unwrap().compactors.len()
    }

    /// Hold compactors before they touch indices or remove files.
    pub async fn pause_compaction(&self) {
        self.gate.pause().await;
    }

    /// Release compactors held by [Coordinator::pause_compaction].
    pub fn resume_compaction(&self) {
        self.gate.resume();
    }
}
