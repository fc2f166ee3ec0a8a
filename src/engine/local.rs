//! Local engine: a fixed pool of workers draining a bounded FIFO queue.
//!
//! ## Task lifecycle on a worker
//!
//! ```text
//!   recv ──▶ started ──▶ acquire pipeline ──▶ for each source:
//!                        (cached, shared)       fetch ─▶ check format ─▶ convert (blocking pool)
//!                                               record meta; stop early on abort_on_error
//!        ──▶ assemble bundle ──▶ put result ──▶ success | failure
//! ```
//!
//! A watchdog runs beside every started task. If it fires first, the task is
//! already `failure` in the registry; the worker drops its in-flight work and
//! anything a blocking conversion produces later is discarded.

use super::{spawn_watchdog, QueuedTask};
use crate::error::{DocumentError, ServeError};
use crate::options::ConversionOptions;
use crate::output::{DocumentResult, ResultBundle};
use crate::pipeline::{
    ConversionPipeline, ConvertedDocument, DocumentConverter, PipelineCache, SourceFetcher,
};
use crate::registry::TaskRegistry;
use crate::results::ResultStore;
use crate::task::{FailureKind, TaskFailure, TaskId, TaskMeta, TaskStatus, TransitionPayload};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared state every worker needs.
pub(crate) struct WorkerContext {
    pub registry: Arc<TaskRegistry>,
    pub results: Arc<ResultStore>,
    pub cache: Arc<PipelineCache>,
    pub converter: Arc<dyn DocumentConverter>,
    pub fetcher: SourceFetcher,
}

/// In-process worker pool.
pub struct LocalEngine {
    ctx: Arc<WorkerContext>,
    tx: mpsc::Sender<QueuedTask>,
    rx: Arc<AsyncMutex<mpsc::Receiver<QueuedTask>>>,
    num_workers: usize,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

enum Outcome {
    /// Every source was attempted; the bundle carries per-document status.
    Completed(ResultBundle),
    /// `abort_on_error` stopped the task at a failed document.
    Aborted(ResultBundle, String),
    /// The task could not run at all.
    Failed(TaskFailure),
}

impl LocalEngine {
    pub(crate) fn new(ctx: WorkerContext, num_workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(ctx),
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            num_workers: num_workers.max(1),
            workers: parking_lot::Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Enqueue without waiting. A full queue is a capacity error.
    pub fn submit(&self, task: QueuedTask) -> Result<(), ServeError> {
        let id = task.id.clone();
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServeError::Capacity {
                reason: format!("local queue is full ({} tasks)", self.tx.max_capacity()),
            },
            mpsc::error::TrySendError::Closed(_) => ServeError::Capacity {
                reason: "local engine is shut down".into(),
            },
        })?;
        debug!("Task {} queued", id);
        Ok(())
    }

    /// Spawn the workers. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for n in 0..self.num_workers {
            let ctx = Arc::clone(&self.ctx);
            let rx = Arc::clone(&self.rx);
            let shutdown = self.shutdown.subscribe();
            workers.push(tokio::spawn(worker_loop(n, ctx, rx, shutdown)));
        }
        info!("Local engine started with {} worker(s)", self.num_workers);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!("Local engine stopped");
    }

    pub fn queue_size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

async fn worker_loop(
    n: usize,
    ctx: Arc<WorkerContext>,
    rx: Arc<AsyncMutex<mpsc::Receiver<QueuedTask>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {} ready", n);
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                task = rx.recv() => task,
                _ = shutdown.changed() => None,
            }
        };
        let Some(task) = next else {
            break;
        };
        run_task(&ctx, task).await;
    }
    debug!("Worker {} exiting", n);
}

async fn run_task(ctx: &WorkerContext, task: QueuedTask) {
    let id = task.id.clone();
    let num_docs = task.sources.len();
    if let Err(e) = ctx.registry.transition(
        &id,
        TaskStatus::Started,
        TransitionPayload::started(TaskMeta::with_docs(num_docs)),
    ) {
        // Removed or already failed while queued.
        warn!("Skipping task {}: {}", id, e);
        return;
    }
    info!("Task {} started with {} document(s)", id, num_docs);

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    let watchdog = spawn_watchdog(
        Arc::clone(&ctx.registry),
        id.clone(),
        task.timeout,
        move || {
            let _ = cancel_tx.send(());
        },
    );

    let outcome = tokio::select! {
        outcome = process(ctx, &task) => Some(outcome),
        Ok(()) = &mut cancel_rx => None,
    };
    watchdog.abort();

    match outcome {
        Some(outcome) => finish(ctx, &id, outcome),
        None => info!("Task {} abandoned, in-flight work discarded", id),
    }
}

async fn process(ctx: &WorkerContext, task: &QueuedTask) -> Outcome {
    let started = Instant::now();
    let options = Arc::clone(&task.options);

    let lease = {
        let converter = Arc::clone(&ctx.converter);
        let build_options = Arc::clone(&options);
        ctx.cache
            .acquire(&task.key, move || async move {
                match tokio::task::spawn_blocking(move || converter.build_pipeline(&build_options))
                    .await
                {
                    Ok(built) => built,
                    Err(e) => Err(ServeError::Internal(format!("pipeline builder panicked: {e}"))),
                }
            })
            .await
    };
    let lease = match lease {
        Ok(lease) => lease,
        Err(e) => {
            error!("Task {}: {}", task.id, e);
            return Outcome::Failed(TaskFailure::new(FailureKind::PipelineBuild, e.to_string()));
        }
    };
    let pipeline = Arc::clone(lease.handle());

    let mut documents = Vec::with_capacity(task.sources.len());
    let mut timings: BTreeMap<String, f64> = BTreeMap::new();
    let mut abort: Option<String> = None;

    for source in &task.sources {
        if abort.is_some() {
            documents.push(DocumentResult::skipped(source.filename()));
            continue;
        }
        let doc_start = Instant::now();
        let converted = convert_one(ctx, &pipeline, source, &options).await;
        let secs = doc_start.elapsed().as_secs_f64();
        let succeeded = converted.is_ok();

        match converted {
            Ok((filename, doc)) => {
                for (phase, t) in doc.timings {
                    *timings.entry(phase).or_default() += t;
                }
                documents.push(DocumentResult::success(filename, doc.content, secs));
            }
            Err(err) => {
                warn!("Task {}: {}", task.id, err);
                if options.abort_on_error {
                    abort = Some(err.to_string());
                }
                documents.push(DocumentResult::failure(source.filename(), err, secs));
            }
        }

        if let Err(e) = ctx.registry.update_meta(&task.id, |meta| {
            meta.get_or_insert_with(|| TaskMeta::with_docs(task.sources.len()))
                .record(succeeded);
            Ok(())
        }) {
            debug!("Task {}: progress not recorded: {}", task.id, e);
        }
    }
    drop(lease);

    let bundle = ResultBundle::assemble(
        documents,
        started.elapsed().as_secs_f64(),
        timings,
        options.to_formats.clone(),
        options.return_as_file,
    );
    match abort {
        Some(reason) => Outcome::Aborted(bundle, reason),
        None => Outcome::Completed(bundle),
    }
}

/// Acquire, check and convert one source.
async fn convert_one(
    ctx: &WorkerContext,
    pipeline: &Arc<dyn ConversionPipeline>,
    source: &crate::pipeline::DocumentSource,
    options: &Arc<ConversionOptions>,
) -> Result<(String, ConvertedDocument), DocumentError> {
    let document = ctx.fetcher.fetch(source).await?;
    match document.format {
        Some(format) if options.accepts(format) => {}
        other => {
            return Err(DocumentError::UnsupportedFormat {
                filename: document.filename.clone(),
                format: other.map_or_else(|| "unknown".to_string(), |f| f.to_string()),
            })
        }
    }

    let filename = document.filename.clone();
    let pipeline = Arc::clone(pipeline);
    let options = Arc::clone(options);
    let join_name = filename.clone();
    let converted = tokio::task::spawn_blocking(move || pipeline.convert(&document, &options))
        .await
        .map_err(|e| DocumentError::ConversionFailed {
            filename: join_name,
            detail: format!("converter panicked: {e}"),
        })??;
    Ok((filename, converted))
}

fn finish(ctx: &WorkerContext, id: &TaskId, outcome: Outcome) {
    match outcome {
        Outcome::Completed(bundle) => {
            let status = bundle.status;
            ctx.results.put(id.clone(), bundle);
            match ctx.registry.transition(
                id,
                TaskStatus::Success,
                TransitionPayload::completed(status),
            ) {
                Ok(_) => info!("Task {} finished: {:?}", id, status),
                Err(e) => discard_result(ctx, id, e),
            }
        }
        Outcome::Aborted(bundle, reason) => {
            let status = bundle.status;
            ctx.results.put(id.clone(), bundle);
            let failure = TaskFailure::new(
                FailureKind::Conversion,
                format!("aborted on first error: {reason}"),
            );
            match ctx.registry.transition(
                id,
                TaskStatus::Failure,
                TransitionPayload::failed(failure).with_result_status(status),
            ) {
                Ok(_) => info!("Task {} aborted after a document failed", id),
                Err(e) => discard_result(ctx, id, e),
            }
        }
        Outcome::Failed(failure) => {
            if let Err(e) =
                ctx.registry
                    .transition(id, TaskStatus::Failure, TransitionPayload::failed(failure))
            {
                debug!("Task {}: failure not recorded: {}", id, e);
            }
        }
    }
}

fn discard_result(ctx: &WorkerContext, id: &TaskId, e: ServeError) {
    ctx.results.delete(id);
    match e {
        ServeError::Abandoned { .. } => info!("Task {} finished after its timeout; result discarded", id),
        other => error!("Task {}: result discarded: {}", id, other),
    }
}
