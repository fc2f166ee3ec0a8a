//! Orchestrator facade: the one object the transport layer talks to.
//!
//! ## Why an explicitly constructed facade?
//!
//! Every shared component (registry, result store, pipeline cache, engine)
//! is created here and handed to collaborators as an `Arc`. There are no
//! globals, so each test builds a fresh, isolated orchestrator.
//!
//! ## Admission
//!
//! ```text
//! options ──▶ validate ──▶ canonicalize ──▶ registry.create (pending) ──▶ engine.submit
//!               │                                                          │
//!               └─ Validation error (never registered)        Capacity ─▶ pending → failure
//! ```
//!
//! Errors discovered after admission (conversion failures, timeouts) never
//! fail the admission call; they land in the task's terminal state.

use crate::config::{EngineConfig, ServeConfig};
use crate::distributor::{StatusDistributor, TaskEventStream};
use crate::engine::local::WorkerContext;
use crate::engine::{
    CallbackAck, Engine, HttpRemoteOrchestrator, LocalEngine, ProgressCallback, QueuedTask,
    RemoteEngine, RemoteOrchestrator,
};
use crate::error::ServeError;
use crate::options::{canonicalize, ConversionOptions};
use crate::output::ResultBundle;
use crate::pipeline::{CacheStats, DocumentConverter, DocumentSource, PipelineCache, SourceFetcher};
use crate::registry::{RegistryStats, TaskRegistry};
use crate::results::{ResultStore, RetentionPolicy};
use crate::task::{
    FailureKind, SubmitMode, TaskFailure, TaskId, TaskSnapshot, TaskStatus, TransitionPayload,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a synchronous conversion produced.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The task succeeded within the wait; the bundle may still report
    /// per-document failures.
    Completed {
        task: TaskSnapshot,
        bundle: Arc<ResultBundle>,
    },
    /// The task failed within the wait. An aborted task still carries the
    /// bundle of the documents it reached.
    Failed {
        task: TaskSnapshot,
        bundle: Option<Arc<ResultBundle>>,
    },
    /// The wait elapsed first. Continue with poll / subscribe / result.
    Pending { task: TaskSnapshot },
}

impl SyncOutcome {
    pub fn task(&self) -> &TaskSnapshot {
        match self {
            SyncOutcome::Completed { task, .. }
            | SyncOutcome::Failed { task, .. }
            | SyncOutcome::Pending { task } => task,
        }
    }
}

/// Diagnostics across every component.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub engine: &'static str,
    pub queue_size: usize,
    pub tasks: RegistryStats,
    pub pipelines: CacheStats,
    pub stored_results: usize,
}

/// Owns every orchestration component and exposes the public operations.
pub struct Orchestrator {
    config: ServeConfig,
    registry: Arc<TaskRegistry>,
    results: Arc<ResultStore>,
    cache: Arc<PipelineCache>,
    converter: Arc<dyn DocumentConverter>,
    distributor: StatusDistributor,
    engine: Engine,
    shutdown: watch::Sender<bool>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator. A remote engine gets an
    /// [`HttpRemoteOrchestrator`] client.
    pub fn new(
        config: ServeConfig,
        converter: Arc<dyn DocumentConverter>,
    ) -> Result<Self, ServeError> {
        let client: Option<Arc<dyn RemoteOrchestrator>> = match &config.engine {
            EngineConfig::Remote(remote) => Some(Arc::new(HttpRemoteOrchestrator::new(remote)?)),
            EngineConfig::Local => None,
        };
        Self::assemble(config, converter, client)
    }

    /// Build an orchestrator whose remote engine uses `client`.
    pub fn with_remote_client(
        config: ServeConfig,
        converter: Arc<dyn DocumentConverter>,
        client: Arc<dyn RemoteOrchestrator>,
    ) -> Result<Self, ServeError> {
        Self::assemble(config, converter, Some(client))
    }

    fn assemble(
        config: ServeConfig,
        converter: Arc<dyn DocumentConverter>,
        client: Option<Arc<dyn RemoteOrchestrator>>,
    ) -> Result<Self, ServeError> {
        let registry = Arc::new(TaskRegistry::new());
        let results = Arc::new(ResultStore::new(RetentionPolicy {
            single_use: config.single_use_results,
            removal_delay: config.result_removal_delay,
            max_retention: config.result_max_retention,
        }));
        let cache = Arc::new(PipelineCache::new(config.pipeline_cache_capacity));

        let engine = match (&config.engine, client) {
            (EngineConfig::Local, _) => Engine::Local(LocalEngine::new(
                WorkerContext {
                    registry: Arc::clone(&registry),
                    results: Arc::clone(&results),
                    cache: Arc::clone(&cache),
                    converter: Arc::clone(&converter),
                    fetcher: SourceFetcher::new(config.download_timeout)?,
                },
                config.num_workers,
                config.queue_capacity,
            )),
            (EngineConfig::Remote(remote), Some(client)) => Engine::Remote(RemoteEngine::new(
                remote,
                client,
                Arc::clone(&registry),
                Arc::clone(&results),
            )),
            (EngineConfig::Remote(_), None) => {
                return Err(ServeError::InvalidConfig(
                    "remote engine selected without a client".into(),
                ))
            }
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            distributor: StatusDistributor::new(Arc::clone(&registry)),
            config,
            registry,
            results,
            cache,
            converter,
            engine,
            shutdown,
            sweeper: parking_lot::Mutex::new(None),
        })
    }

    /// Start the engine and the result sweeper, then warm the pipeline cache.
    pub async fn start(&self) {
        self.engine.start();
        {
            let mut sweeper = self.sweeper.lock();
            if sweeper.is_none() {
                *sweeper = Some(
                    self.results
                        .spawn_sweeper(self.config.sweep_interval, self.shutdown.subscribe()),
                );
            }
        }
        self.registry.republish_pending();
        if matches!(self.engine, Engine::Local(_)) {
            if let Err(e) = self.warm_up().await {
                warn!("Pipeline warm-up failed: {}", e);
            }
        }
        info!("Orchestrator started ({} engine)", self.engine.name());
    }

    /// Build the pipeline for default options ahead of the first request.
    pub async fn warm_up(&self) -> Result<(), ServeError> {
        let options = Arc::new(ConversionOptions::default());
        let key = canonicalize(&options)?;
        let converter = Arc::clone(&self.converter);
        let lease = self
            .cache
            .acquire(&key, move || async move {
                match tokio::task::spawn_blocking(move || converter.build_pipeline(&options)).await {
                    Ok(built) => built,
                    Err(e) => Err(ServeError::Internal(format!("pipeline builder panicked: {e}"))),
                }
            })
            .await?;
        debug!("Warmed up pipeline {}", key.short());
        drop(lease);
        Ok(())
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Admit a conversion request and hand it to the engine.
    ///
    /// Validation and capacity errors are returned here; everything later is
    /// reported through the task's status.
    pub async fn submit(
        &self,
        options: ConversionOptions,
        sources: Vec<DocumentSource>,
        mode: SubmitMode,
    ) -> Result<TaskSnapshot, ServeError> {
        options.validate_with_limit(self.config.max_document_timeout)?;
        if sources.is_empty() {
            return Err(ServeError::Validation(
                "at least one source is required".into(),
            ));
        }
        let key = canonicalize(&options)?;
        let timeout = options.effective_timeout(self.config.max_document_timeout);

        let admitted = self.registry.create(key.clone(), mode);
        let id = admitted.task_id.clone();
        let task = QueuedTask {
            id: id.clone(),
            options: Arc::new(options),
            key,
            sources,
            timeout,
        };
        if let Err(e) = self.engine.submit(task).await {
            warn!("Task {} refused: {}", id, e);
            let failure = TaskFailure::new(FailureKind::Capacity, e.to_string());
            if let Err(t) =
                self.registry
                    .transition(&id, TaskStatus::Failure, TransitionPayload::failed(failure))
            {
                debug!("Task {}: refusal not recorded: {}", id, t);
            }
            return Err(e);
        }
        info!("Task {} admitted ({:?})", id, mode);
        Ok(self.registry.snapshot(&id).unwrap_or(admitted))
    }

    /// Admit a request and wait for it.
    ///
    /// Waits at most `max_wait`, capped by the configured `max_sync_wait`.
    /// When the wait elapses the outcome is [`SyncOutcome::Pending`] rather
    /// than an error.
    pub async fn convert_sync(
        &self,
        options: ConversionOptions,
        sources: Vec<DocumentSource>,
        max_wait: Option<Duration>,
    ) -> Result<SyncOutcome, ServeError> {
        let admitted = self.submit(options, sources, SubmitMode::Sync).await?;
        let wait = max_wait
            .unwrap_or(self.config.max_sync_wait)
            .min(self.config.max_sync_wait);
        let id = admitted.task_id;
        let task = self.distributor.wait_terminal(&id, wait).await?;

        Ok(match task.task_status {
            TaskStatus::Success => {
                let bundle = self.results.get(&id)?;
                SyncOutcome::Completed { task, bundle }
            }
            TaskStatus::Failure => {
                let bundle = self.results.get(&id).ok();
                SyncOutcome::Failed { task, bundle }
            }
            TaskStatus::Pending | TaskStatus::Started => {
                info!("Task {} still {} after {}s; returning handle", id, task.task_status, wait.as_secs());
                SyncOutcome::Pending { task }
            }
        })
    }

    // ── Status ───────────────────────────────────────────────────────────

    pub async fn poll(&self, id: &TaskId, max_wait: Duration) -> Result<TaskSnapshot, ServeError> {
        self.distributor.poll(id, max_wait).await
    }

    pub fn subscribe(&self, id: &TaskId) -> Result<TaskEventStream, ServeError> {
        self.distributor.subscribe(id)
    }

    // ── Results ──────────────────────────────────────────────────────────

    /// Fetch the result of a finished task.
    ///
    /// [`ServeError::ResultNotReady`] while the task is still running,
    /// [`ServeError::ResultNotFound`] for unknown ids and for results that
    /// were consumed, cleared or never produced.
    pub fn result(&self, id: &TaskId) -> Result<Arc<ResultBundle>, ServeError> {
        if let Some(task) = self.registry.get(id) {
            if !task.status.is_terminal() {
                return Err(ServeError::ResultNotReady {
                    task_id: id.clone(),
                    status: task.status,
                });
            }
        }
        self.results.get(id)
    }

    // ── Remote engine ────────────────────────────────────────────────────

    /// Apply a progress callback from the remote orchestrator.
    pub async fn receive_progress(
        &self,
        bearer: Option<&str>,
        callback: ProgressCallback,
    ) -> Result<CallbackAck, ServeError> {
        match self.engine.as_remote() {
            Some(remote) => remote.handle_callback(bearer, callback).await,
            None => Err(ServeError::InvalidProgress(
                "progress callbacks require the remote engine".into(),
            )),
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Drop results and task records that finished more than `older_than`
    /// ago. Returns the number of tasks removed.
    pub fn clear_results(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let finished = self.registry.finished_before(cutoff);
        for id in &finished {
            self.results.delete(id);
            self.registry.remove(id);
        }
        let orphans = self.results.clear_older_than(older_than);
        if let Some(remote) = self.engine.as_remote() {
            remote.prune();
        }
        info!(
            "Cleared {} finished task(s) and {} stored result(s) older than {}s",
            finished.len(),
            orphans.len(),
            older_than.as_secs()
        );
        finished.len()
    }

    /// Drop every idle cached pipeline. Returns the number removed.
    pub fn clear_pipelines(&self) -> usize {
        let removed = self.cache.clear();
        info!("Cleared {} cached pipeline(s)", removed);
        removed
    }

    pub fn queue_size(&self) -> usize {
        self.engine.queue_size()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            engine: self.engine.name(),
            queue_size: self.engine.queue_size(),
            tasks: self.registry.stats(),
            pipelines: self.cache.stats(),
            stored_results: self.results.len(),
        }
    }

    /// Stop the engine and the sweeper.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.engine.shutdown().await;
        info!("Orchestrator stopped");
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn pipelines(&self) -> &Arc<PipelineCache> {
        &self.cache
    }

    pub fn distributor(&self) -> &StatusDistributor {
        &self.distributor
    }
}
