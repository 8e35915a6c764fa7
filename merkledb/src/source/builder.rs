use super::{
    metadata,
    storage::{self, validate_name},
    Config, DataSource, Error,
};
use crate::compaction::Executor;
use commonware_runtime::{Clock, Metrics, Spawner, Storage};
use std::sync::Arc;
use tracing::{info, warn};

/// Creates, snapshots, and restores [DataSource]s sharing one configuration.
#[derive(Clone)]
pub struct Builder<E: Spawner + Storage + Clock + Metrics> {
    context: E,
    cfg: Config,
    executor: Option<Arc<Executor>>,
}

impl<E: Spawner + Storage + Clock + Metrics> Builder<E> {
    /// Create a builder for tables configured with `cfg`.
    ///
    /// Compactions run on the process-wide [Executor] unless another is provided with
    /// [Builder::with_executor].
    pub fn new(context: E, cfg: Config) -> Self {
        Self {
            context,
            cfg,
            executor: None,
        }
    }

    /// Run the compactions of every table built from now on on `executor`.
    pub fn with_executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    fn executor(&self) -> Arc<Executor> {
        match &self.executor {
            Some(executor) => executor.clone(),
            None => Executor::global(self.cfg.compaction_threads),
        }
    }

    async fn open(&self, name: &str, ephemeral: bool) -> Result<DataSource<E>, Error> {
        validate_name(name)?;
        DataSource::init(
            self.context.with_label(name),
            name,
            &self.cfg,
            ephemeral,
            self.executor(),
        )
        .await
    }

    /// Open (or create) the table `name`.
    pub async fn build(&self, name: &str) -> Result<DataSource<E>, Error> {
        self.open(name, false).await
    }

    /// Create the table `name`, removing all of its partitions when the table is closed.
    pub async fn build_ephemeral(&self, name: &str) -> Result<DataSource<E>, Error> {
        self.open(name, true).await
    }

    /// Write a snapshot of `source` to the table `target` (see [DataSource::snapshot]).
    pub async fn snapshot(&self, source: &DataSource<E>, target: &str) -> Result<(), Error> {
        source.snapshot(target).await
    }

    /// Open the table `name` from a copy of the snapshot `snapshot`.
    ///
    /// The snapshot is never modified and can be restored any number of times.
    pub async fn restore(&self, snapshot: &str, name: &str) -> Result<DataSource<E>, Error> {
        validate_name(snapshot)?;
        validate_name(name)?;
        if snapshot == name || storage::exists(&self.context, name).await? {
            return Err(Error::TargetExists(name.to_string()));
        }
        if metadata::read(&self.context, snapshot).await?.is_none() {
            return Err(Error::MissingMetadata(snapshot.to_string()));
        }
        if let Err(err) = storage::copy(&self.context, snapshot, name).await {
            if let Err(cleanup) = storage::remove(&self.context, name).await {
                warn!(table = name, ?cleanup, "failed to remove partial restore");
            }
            return Err(err);
        }
        info!(table = name, snapshot, "restoring table");
        self.build(name).await
    }

    /// Snapshot `source` into the table `name` and open the copy.
    pub async fn copy(&self, source: &DataSource<E>, name: &str) -> Result<DataSource<E>, Error> {
        source.snapshot(name).await?;
        self.build(name).await
    }
}
