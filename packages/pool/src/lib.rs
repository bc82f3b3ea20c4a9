//! Worker pool and request multiplexer for the bundler engine.
//!
//! The pool warms up a fixed set of background executors, each hosting its
//! own engine instance, and routes correlated request/response/progress
//! frames between callers and workers. Reload is the sole cancellation
//! primitive: it rejects every outstanding task, terminates the prior
//! generation, and swaps in a freshly built pool.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use packbox_http::HttpClient;
use packbox_installer::{NpmInstaller, ProgressSender};
use packbox_vfs::Vfs;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;

pub mod engine;
pub mod fmt;
pub mod worker;

pub use engine::{
    load_engine_artifacts, BuildResult, Engine, EngineArtifacts, EngineError, EngineFactory,
    EngineSetupError, LoadEngineError, Message, OutputFile, TransformResult, MIN_ENGINE_VERSION,
};
pub use worker::{WorkerReply, WorkerRequest};

use worker::{ReplyFrame, TaskFrame};

/// Rejection reason handed to every task pending across a reload.
pub const TASK_ABORTED_REASON: &str = "Task aborted due to reload";

pub const DEFAULT_MIN_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool sizing and engine selection.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub esbuild_version: String,
    pub min_concurrency: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub queue_timeout: Duration,
}

impl PoolOptions {
    #[must_use]
    pub fn new(esbuild_version: impl Into<String>) -> Self {
        Self {
            esbuild_version: esbuild_version.into(),
            min_concurrency: None,
            max_concurrency: None,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }
}

/// Clamp the machine's advertised parallelism (default 2 when unknown) into
/// `[min ?? 2, max ?? 5]`.
#[must_use]
pub fn clamp_concurrency(min: Option<usize>, max: Option<usize>) -> usize {
    let available = std::thread::available_parallelism().map_or(2, NonZeroUsize::get);
    let min = min.unwrap_or(DEFAULT_MIN_CONCURRENCY);
    let max = max.unwrap_or(DEFAULT_MAX_CONCURRENCY).max(min);
    available.clamp(min, max)
}

#[derive(Debug, Error)]
pub enum PoolBootstrapError {
    #[error(transparent)]
    LoadEngine(#[from] LoadEngineError),
    #[error("No workers finished setup successfully")]
    NoWorkers,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Timed out waiting for an idle worker after {0:?}")]
    QueueTimeout(Duration),
    #[error("{0}")]
    Rejected(String),
    #[error("Worker pool is shutting down")]
    PoolClosed,
}

struct Waiting {
    tx: oneshot::Sender<Result<Value, String>>,
    progress: Option<ProgressSender>,
}

type WaitingTable = Arc<Mutex<HashMap<String, Waiting>>>;

#[derive(Clone)]
struct WorkerSlot {
    tx: flume::Sender<TaskFrame>,
}

/// One generation of workers. Replaced wholesale on reload.
struct PoolGeneration {
    size: usize,
    idle_tx: flume::Sender<WorkerSlot>,
    idle_rx: flume::Receiver<WorkerSlot>,
    waiting: WaitingTable,
    token: CancellationToken,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

/// The worker pool.
pub struct Pool {
    http: Arc<dyn HttpClient>,
    factory: Arc<dyn EngineFactory>,
    installer: NpmInstaller,
    shared_fs: Arc<RwLock<Vfs>>,
    queue_timeout: Duration,
    size: usize,
    version: std::sync::RwLock<String>,
    generation: RwLock<PoolGeneration>,
}

impl Pool {
    /// Fetch engine artifacts and warm up the pool.
    ///
    /// # Errors
    ///
    /// * If the engine artifacts cannot be fetched
    /// * If every worker fails setup
    pub async fn new(
        options: PoolOptions,
        http: Arc<dyn HttpClient>,
        factory: Arc<dyn EngineFactory>,
        installer: NpmInstaller,
        shared_fs: Arc<RwLock<Vfs>>,
    ) -> Result<Self, PoolBootstrapError> {
        let size = clamp_concurrency(options.min_concurrency, options.max_concurrency);
        let artifacts =
            load_engine_artifacts(http.as_ref(), &options.esbuild_version).await?;

        let generation = build_generation(
            &factory,
            &Arc::new(artifacts),
            &installer,
            &shared_fs,
            size,
        )
        .await?;

        log::debug!(
            "Pool ready: {admitted}/{size} workers for engine {version}",
            admitted = generation.size,
            version = options.esbuild_version
        );

        Ok(Self {
            http,
            factory,
            installer,
            shared_fs,
            queue_timeout: options.queue_timeout,
            size,
            version: std::sync::RwLock::new(options.esbuild_version),
            generation: RwLock::new(generation),
        })
    }

    /// Requested pool width.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// The engine version the current generation runs.
    #[must_use]
    pub fn version(&self) -> String {
        self.version.read().unwrap().clone()
    }

    /// Submit a request and await its terminal reply. Progress frames are
    /// routed to `progress` in the order the worker posted them.
    ///
    /// # Errors
    ///
    /// * If no worker becomes idle within the queue timeout
    /// * If the worker rejects the task (including reload aborts)
    pub async fn submit(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSender>,
    ) -> Result<Value, SubmitError> {
        let (idle_tx, idle_rx, waiting) = {
            let generation = self.generation.read().await;
            (
                generation.idle_tx.clone(),
                generation.idle_rx.clone(),
                generation.waiting.clone(),
            )
        };

        let slot = tokio::time::timeout(self.queue_timeout, idle_rx.recv_async())
            .await
            .map_err(|_| SubmitError::QueueTimeout(self.queue_timeout))?
            .map_err(|_| SubmitError::PoolClosed)?;

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        waiting
            .lock()
            .unwrap()
            .insert(id.clone(), Waiting { tx, progress });

        log::trace!("Dispatching task id={id}");

        if slot.tx.send((id.clone(), request)).is_err() {
            waiting.lock().unwrap().remove(&id);
            return Err(SubmitError::PoolClosed);
        }

        let result = rx.await;

        // The worker is done with this task either way; hand the slot back.
        let _ = idle_tx.try_send(slot);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(SubmitError::Rejected(reason)),
            Err(_) => Err(SubmitError::PoolClosed),
        }
    }

    /// Swap the engine version at runtime.
    ///
    /// Rejects every outstanding task with [`TASK_ABORTED_REASON`],
    /// terminates the prior generation unconditionally, then builds and
    /// installs a fresh pool before admitting new submissions.
    ///
    /// # Errors
    ///
    /// * If the new engine artifacts cannot be fetched
    /// * If every worker of the new generation fails setup
    pub async fn reload(&self, esbuild_version: &str) -> Result<(), PoolBootstrapError> {
        let mut generation = self.generation.write().await;

        let pending = generation
            .waiting
            .lock()
            .unwrap()
            .drain()
            .collect::<Vec<_>>();
        log::debug!(
            "Reloading pool to engine {esbuild_version}, aborting {count} pending task(s)",
            count = pending.len()
        );
        for (id, entry) in pending {
            log::trace!("Rejecting task id={id}: {TASK_ABORTED_REASON}");
            let _ = entry.tx.send(Err(TASK_ABORTED_REASON.to_string()));
        }

        generation.token.cancel();
        for handle in &generation.workers {
            handle.abort();
        }

        let artifacts = load_engine_artifacts(self.http.as_ref(), esbuild_version).await?;
        *generation = build_generation(
            &self.factory,
            &Arc::new(artifacts),
            &self.installer,
            &self.shared_fs,
            self.size,
        )
        .await?;

        *self.version.write().unwrap() = esbuild_version.to_string();

        Ok(())
    }

    /// Tear the pool down, terminating every worker.
    pub async fn shutdown(&self) {
        let generation = self.generation.read().await;
        generation.token.cancel();
        for handle in &generation.workers {
            handle.abort();
        }
    }
}

async fn build_generation(
    factory: &Arc<dyn EngineFactory>,
    artifacts: &Arc<EngineArtifacts>,
    installer: &NpmInstaller,
    shared_fs: &Arc<RwLock<Vfs>>,
    size: usize,
) -> Result<PoolGeneration, PoolBootstrapError> {
    let (idle_tx, idle_rx) = flume::bounded(size);
    let (reply_tx, reply_rx) = flume::unbounded::<ReplyFrame>();
    let waiting: WaitingTable = Arc::new(Mutex::new(HashMap::new()));
    let token = CancellationToken::new();

    let mut workers = Vec::with_capacity(size);

    for index in 0..size {
        let (task_tx, task_rx) = flume::unbounded::<TaskFrame>();

        match worker::spawn_worker(
            index,
            factory.clone(),
            artifacts.clone(),
            installer.clone(),
            shared_fs.clone(),
            task_rx,
            reply_tx.clone(),
            token.clone(),
        )
        .await
        {
            Ok(handle) => {
                workers.push(handle);
                idle_tx
                    .try_send(WorkerSlot { tx: task_tx })
                    .expect("idle channel has pool-width capacity");
            }
            Err(e) => {
                log::error!("Worker {index} failed setup: {e:?}");
            }
        }
    }

    drop(reply_tx);

    if workers.is_empty() {
        return Err(PoolBootstrapError::NoWorkers);
    }

    let admitted = workers.len();
    workers.push(spawn_router(reply_rx, waiting.clone()));

    Ok(PoolGeneration {
        size: admitted,
        idle_tx,
        idle_rx,
        waiting,
        token,
        workers,
    })
}

/// Routes worker replies by correlation id. Terminal statuses free the slot;
/// progress does not. Replies for unknown ids (late responses after timeout
/// or reload) are dropped.
fn spawn_router(
    reply_rx: flume::Receiver<ReplyFrame>,
    waiting: WaitingTable,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((id, reply)) = reply_rx.recv_async().await {
            match reply {
                WorkerReply::Progress(event) => {
                    let waiting = waiting.lock().unwrap();
                    if let Some(entry) = waiting.get(&id) {
                        if let Some(progress) = &entry.progress {
                            let _ = progress.send(event);
                        }
                    } else {
                        log::trace!("Dropping progress for unknown task id={id}");
                    }
                }
                WorkerReply::Resolve(value) => {
                    if let Some(entry) = waiting.lock().unwrap().remove(&id) {
                        let _ = entry.tx.send(Ok(value));
                    } else {
                        log::trace!("Dropping late resolve for task id={id}");
                    }
                }
                WorkerReply::Reject(reason) => {
                    if let Some(entry) = waiting.lock().unwrap().remove(&id) {
                        let _ = entry.tx.send(Err(reason));
                    } else {
                        log::trace!("Dropping late reject for task id={id}");
                    }
                }
            }
        }
    })
}
