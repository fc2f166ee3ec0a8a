//! Remote engine: delegate tasks to an external job orchestrator.
//!
//! Nothing is converted in-process. Each task becomes a job on the remote
//! side, and completion comes back through one of two paths:
//!
//! * **callbacks**: the orchestrator POSTs [`ProgressCallback`]s to this
//!   server, authenticated with a bearer token;
//! * **polling**: a background loop asks the orchestrator for the status of
//!   every outstanding job on a fixed interval.
//!
//! Both paths close the task through [`TaskRegistry::close`], so whichever
//! arrives second (or arrives after the watchdog) is acknowledged and
//! dropped.
//!
//! ## Why hash the callback token?
//!
//! The expected token is kept only as a SHA-256 digest and incoming tokens
//! are hashed before comparison, so the comparison cost does not depend on
//! how many leading bytes match.

use super::{spawn_watchdog, QueuedTask};
use crate::config::{CompletionMode, RemoteConfig};
use crate::error::ServeError;
use crate::options::ConversionOptions;
use crate::output::ResultBundle;
use crate::pipeline::DocumentSource;
use crate::registry::TaskRegistry;
use crate::results::ResultStore;
use crate::task::{FailureKind, TaskFailure, TaskId, TaskMeta, TaskStatus, TransitionPayload};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Wire types ───────────────────────────────────────────────────────────

/// Job submitted to the remote orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteJob {
    pub task_id: TaskId,
    pub options: ConversionOptions,
    pub sources: Vec<DocumentSource>,
    /// Where the orchestrator should send progress callbacks, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub timeout_secs: u64,
}

/// Job state as reported by the remote orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl RemoteJobState {
    /// Registry status this remote state corresponds to.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            RemoteJobState::Pending => TaskStatus::Pending,
            RemoteJobState::Running => TaskStatus::Started,
            RemoteJobState::Succeeded => TaskStatus::Success,
            RemoteJobState::Failed | RemoteJobState::Canceled | RemoteJobState::Skipped => {
                TaskStatus::Failure
            }
        }
    }
}

/// Status document returned by `GET {endpoint}/jobs/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJobStatus {
    pub state: RemoteJobState,
    #[serde(default)]
    pub meta: Option<TaskMeta>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Inbound progress callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressCallback {
    pub task_id: TaskId,
    pub progress: ProgressUpdate,
}

/// One progress step reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressUpdate {
    /// The job started and will process this many documents.
    SetNumDocs { num_docs: usize },
    /// Counters for documents finished since the last update.
    UpdateProcessed {
        num_processed: usize,
        num_succeeded: usize,
        num_failed: usize,
        #[serde(default)]
        docs_succeeded: Vec<String>,
        #[serde(default)]
        docs_failed: Vec<String>,
    },
    /// The job finished. Without an inline result it is fetched from the
    /// orchestrator.
    Completed {
        #[serde(default)]
        result: Option<ResultBundle>,
    },
    Failed { error: String },
}

/// Response body for an accepted callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    pub status: String,
}

impl CallbackAck {
    pub fn ack() -> Self {
        Self {
            status: "ack".into(),
        }
    }
}

// ── Client contract ──────────────────────────────────────────────────────

/// The external job orchestrator.
#[async_trait]
pub trait RemoteOrchestrator: Send + Sync {
    /// Submit a job; returns the orchestrator's job id.
    async fn submit_job(&self, job: &RemoteJob) -> Result<String, ServeError>;

    async fn job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ServeError>;

    async fn job_result(&self, job_id: &str) -> Result<ResultBundle, ServeError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

/// [`RemoteOrchestrator`] speaking JSON over HTTP(S).
///
/// `POST {endpoint}/jobs`, `GET {endpoint}/jobs/{id}` and
/// `GET {endpoint}/jobs/{id}/result`, each with the configured bearer token.
pub struct HttpRemoteOrchestrator {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpRemoteOrchestrator {
    pub fn new(config: &RemoteConfig) -> Result<Self, ServeError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(60));
        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                ServeError::InvalidConfig(format!("cannot read CA certificate {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ServeError::InvalidConfig(format!("invalid CA certificate {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| ServeError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.endpoint, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ServeError> {
        let response = req
            .send()
            .await
            .map_err(|e| ServeError::Remote(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServeError::Remote(format!("HTTP {status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServeError::Remote(format!("invalid response: {e}")))
    }
}

#[async_trait]
impl RemoteOrchestrator for HttpRemoteOrchestrator {
    async fn submit_job(&self, job: &RemoteJob) -> Result<String, ServeError> {
        let req = self.request(reqwest::Method::POST, "/jobs").json(job);
        let resp: SubmitResponse = self.send(req).await?;
        Ok(resp.job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<RemoteJobStatus, ServeError> {
        self.send(self.request(reqwest::Method::GET, &format!("/jobs/{job_id}")))
            .await
    }

    async fn job_result(&self, job_id: &str) -> Result<ResultBundle, ServeError> {
        self.send(self.request(reqwest::Method::GET, &format!("/jobs/{job_id}/result")))
            .await
    }
}

// ── Engine ───────────────────────────────────────────────────────────────

struct Job {
    job_id: String,
    watchdog: JoinHandle<()>,
}

/// Engine that runs tasks on an external orchestrator.
pub struct RemoteEngine {
    client: Arc<dyn RemoteOrchestrator>,
    registry: Arc<TaskRegistry>,
    results: Arc<ResultStore>,
    jobs: Arc<DashMap<TaskId, Job>>,
    completion: CompletionMode,
    callback_url: Option<String>,
    callback_digest: Option<[u8; 32]>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl RemoteEngine {
    pub(crate) fn new(
        config: &RemoteConfig,
        client: Arc<dyn RemoteOrchestrator>,
        registry: Arc<TaskRegistry>,
        results: Arc<ResultStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            registry,
            results,
            jobs: Arc::new(DashMap::new()),
            completion: config.completion,
            callback_url: config.self_callback_endpoint.clone(),
            callback_digest: config.callback_token.as_deref().map(digest),
            poller: parking_lot::Mutex::new(None),
            shutdown,
        }
    }

    /// Submit the task as a remote job. A rejected submission is reported
    /// as a capacity error.
    pub async fn submit(&self, task: QueuedTask) -> Result<(), ServeError> {
        let job = RemoteJob {
            task_id: task.id.clone(),
            options: (*task.options).clone(),
            sources: task.sources,
            callback_url: match self.completion {
                CompletionMode::Callback => self.callback_url.clone(),
                CompletionMode::Polling { .. } => None,
            },
            timeout_secs: task.timeout.as_secs(),
        };
        let job_id = self
            .client
            .submit_job(&job)
            .await
            .map_err(|e| ServeError::Capacity {
                reason: format!("remote submission failed: {e}"),
            })?;
        info!("Task {} submitted as remote job {}", task.id, job_id);
        let jobs = Arc::clone(&self.jobs);
        let expired = task.id.clone();
        let watchdog = spawn_watchdog(
            Arc::clone(&self.registry),
            task.id.clone(),
            task.timeout,
            move || {
                jobs.remove(&expired);
            },
        );
        let id = task.id;
        self.jobs.insert(id.clone(), Job { job_id, watchdog });
        // The task may have finished or been cleared while the job was in flight.
        if !self.is_live(&id) {
            self.context().forget(&id);
        }
        Ok(())
    }

    fn is_live(&self, id: &TaskId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|t| !t.status.is_terminal())
    }

    /// Drop jobs whose task has finished or is no longer registered.
    /// Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let stale: Vec<TaskId> = self
            .jobs
            .iter()
            .filter(|job| !self.is_live(job.key()))
            .map(|job| job.key().clone())
            .collect();
        let ctx = self.context();
        for id in &stale {
            ctx.forget(id);
        }
        if !stale.is_empty() {
            debug!("Pruned {} finished remote jobs", stale.len());
        }
        stale.len()
    }

    /// Start the polling loop when polling is configured.
    pub fn start(&self) {
        let CompletionMode::Polling { interval } = self.completion else {
            info!("Remote engine waiting for callbacks");
            return;
        };
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let ctx = self.context();
        let mut shutdown = self.shutdown.subscribe();
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => ctx.poll_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
        info!("Remote engine polling every {}s", interval.as_secs_f64());
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        for job in self.jobs.iter() {
            job.watchdog.abort();
        }
    }

    /// Outstanding remote jobs.
    pub fn queue_size(&self) -> usize {
        self.jobs.len()
    }

    /// Query every outstanding job once.
    pub async fn poll_once(&self) {
        self.context().poll_once().await
    }

    /// Apply an inbound progress callback.
    ///
    /// `bearer` is the token from the `Authorization` header. When a
    /// callback token is configured, a missing or different token is
    /// [`ServeError::Unauthorized`].
    pub async fn handle_callback(
        &self,
        bearer: Option<&str>,
        callback: ProgressCallback,
    ) -> Result<CallbackAck, ServeError> {
        if let Some(expected) = &self.callback_digest {
            match bearer {
                Some(token) if &digest(token) == expected => {}
                _ => return Err(ServeError::Unauthorized),
            }
        }
        let ctx = self.context();
        let id = callback.task_id;
        let task = ctx
            .registry
            .get(&id)
            .ok_or_else(|| ServeError::TaskNotFound { task_id: id.clone() })?;
        debug!("Callback for task {}: {:?}", id, callback.progress);

        match callback.progress {
            ProgressUpdate::SetNumDocs { num_docs } => {
                if task.status == TaskStatus::Pending {
                    ctx.registry.transition(
                        &id,
                        TaskStatus::Started,
                        TransitionPayload::started(TaskMeta::with_docs(num_docs)),
                    )?;
                } else {
                    ctx.registry.update_meta(&id, |meta| {
                        meta.get_or_insert_with(TaskMeta::default).num_docs = num_docs;
                        Ok(())
                    })?;
                }
            }
            ProgressUpdate::UpdateProcessed {
                num_processed,
                num_succeeded,
                num_failed,
                ..
            } => {
                ctx.registry.update_meta(&id, |meta| {
                    let meta = meta.as_mut().ok_or_else(|| {
                        ServeError::InvalidProgress("set_num_docs was never received".into())
                    })?;
                    meta.num_processed += num_processed;
                    meta.num_succeeded += num_succeeded;
                    meta.num_failed += num_failed;
                    Ok(())
                })?;
            }
            ProgressUpdate::Completed { .. } | ProgressUpdate::Failed { .. }
                if task.status.is_terminal() =>
            {
                debug!("Ignoring duplicate completion for finished task {}", id);
                ctx.forget(&id);
            }
            ProgressUpdate::Completed { result } => {
                let bundle = match result {
                    Some(bundle) => bundle,
                    None => {
                        let job_id = ctx.job_id(&id)?;
                        ctx.client.job_result(&job_id).await?
                    }
                };
                ctx.complete(&id, bundle)?;
            }
            ProgressUpdate::Failed { error } => {
                ctx.fail(&id, TaskFailure::new(FailureKind::Remote, error))?;
            }
        }
        Ok(CallbackAck::ack())
    }

    fn context(&self) -> RemoteContext {
        RemoteContext {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            results: Arc::clone(&self.results),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

/// Everything the polling loop and the callback path share.
#[derive(Clone)]
struct RemoteContext {
    client: Arc<dyn RemoteOrchestrator>,
    registry: Arc<TaskRegistry>,
    results: Arc<ResultStore>,
    jobs: Arc<DashMap<TaskId, Job>>,
}

impl RemoteContext {
    fn job_id(&self, id: &TaskId) -> Result<String, ServeError> {
        self.jobs
            .get(id)
            .map(|job| job.job_id.clone())
            .ok_or_else(|| ServeError::Remote(format!("no remote job for task {id}")))
    }

    async fn poll_once(&self) {
        let outstanding: Vec<(TaskId, String)> = self
            .jobs
            .iter()
            .map(|job| (job.key().clone(), job.job_id.clone()))
            .collect();
        for (id, job_id) in outstanding {
            let finished = self
                .registry
                .get(&id)
                .is_none_or(|t| t.status.is_terminal());
            if finished {
                // Expired by the watchdog or cleared.
                self.forget(&id);
                continue;
            }
            match self.client.job_status(&job_id).await {
                Ok(status) => {
                    if let Err(e) = self.apply_status(&id, &job_id, status).await {
                        warn!("Task {}: remote status not applied: {}", id, e);
                    }
                }
                Err(e) => warn!("Task {}: status of remote job {} unavailable: {}", id, job_id, e),
            }
        }
    }

    async fn apply_status(
        &self,
        id: &TaskId,
        job_id: &str,
        status: RemoteJobStatus,
    ) -> Result<(), ServeError> {
        match status.state.task_status() {
            TaskStatus::Pending => Ok(()),
            TaskStatus::Started => {
                let meta = status.meta.unwrap_or_default();
                self.ensure_started(id, meta)?;
                if status.meta.is_some() {
                    self.registry.update_meta(id, |m| {
                        *m = Some(meta);
                        Ok(())
                    })?;
                }
                Ok(())
            }
            TaskStatus::Success => {
                let bundle = self.client.job_result(job_id).await?;
                self.complete(id, bundle)
            }
            TaskStatus::Failure => {
                let message = status
                    .error
                    .unwrap_or_else(|| format!("remote job ended as {:?}", status.state));
                self.fail(id, TaskFailure::new(FailureKind::Remote, message))
            }
        }
    }

    fn ensure_started(&self, id: &TaskId, meta: TaskMeta) -> Result<(), ServeError> {
        let pending = self
            .registry
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Pending);
        if pending {
            self.registry
                .transition(id, TaskStatus::Started, TransitionPayload::started(meta))?;
        }
        Ok(())
    }

    fn complete(&self, id: &TaskId, bundle: ResultBundle) -> Result<(), ServeError> {
        if self.finished(id) {
            return Ok(());
        }
        let mut meta = TaskMeta::with_docs(bundle.documents.len());
        for doc in &bundle.documents {
            match doc.status {
                crate::output::ConversionStatus::Success => meta.record(true),
                crate::output::ConversionStatus::Failure => meta.record(false),
                _ => {}
            }
        }
        self.ensure_started(id, meta)?;
        let status = bundle.status;
        self.results.put(id.clone(), bundle);
        let payload = TransitionPayload {
            meta: Some(meta),
            ..TransitionPayload::completed(status)
        };
        let closed = self.registry.close(id, TaskStatus::Success, payload);
        self.forget(id);
        match closed {
            Ok(Some(_)) => {
                info!("Task {} completed remotely: {:?}", id, status);
                Ok(())
            }
            // Lost the race against the other completion path or the watchdog.
            // A successful winner stored the same result; keep it.
            Ok(None) => {
                let failed = self
                    .registry
                    .get(id)
                    .is_some_and(|t| t.status == TaskStatus::Failure);
                if failed {
                    self.results.delete(id);
                }
                Ok(())
            }
            Err(e) => {
                self.results.delete(id);
                Err(e)
            }
        }
    }

    fn fail(&self, id: &TaskId, failure: TaskFailure) -> Result<(), ServeError> {
        let closed = self
            .registry
            .close(id, TaskStatus::Failure, TransitionPayload::failed(failure.clone()));
        self.forget(id);
        if let Ok(Some(_)) = closed {
            warn!("Task {} failed remotely: {}", id, failure.message);
        }
        closed.map(|_| ())
    }

    /// `true` when `id` already reached a terminal status. A duplicate
    /// completion, e.g. a callback after the poller closed the task, is
    /// acknowledged without touching the task.
    fn finished(&self, id: &TaskId) -> bool {
        let done = self
            .registry
            .get(id)
            .is_some_and(|t| t.status.is_terminal());
        if done {
            debug!("Ignoring duplicate completion for finished task {}", id);
            self.forget(id);
        }
        done
    }

    fn forget(&self, id: &TaskId) {
        if let Some((_, job)) = self.jobs.remove(id) {
            job.watchdog.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::canonicalize;
    use crate::output::{ConversionStatus, DocumentContent, DocumentResult};
    use crate::results::RetentionPolicy;
    use crate::task::SubmitMode;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeOrchestrator {
        submitted: Mutex<Vec<RemoteJob>>,
        state: Mutex<Option<RemoteJobStatus>>,
        reject: bool,
    }

    fn bundle() -> ResultBundle {
        ResultBundle::assemble(
            vec![DocumentResult::success(
                "a.md",
                DocumentContent {
                    md_content: Some("# A\n".into()),
                    ..DocumentContent::default()
                },
                0.1,
            )],
            0.1,
            BTreeMap::new(),
            vec![crate::options::OutputFormat::Md],
            false,
        )
    }

    #[async_trait]
    impl RemoteOrchestrator for FakeOrchestrator {
        async fn submit_job(&self, job: &RemoteJob) -> Result<String, ServeError> {
            if self.reject {
                return Err(ServeError::Remote("HTTP 503".into()));
            }
            self.submitted.lock().push(job.clone());
            Ok(format!("job-{}", job.task_id))
        }

        async fn job_status(&self, _job_id: &str) -> Result<RemoteJobStatus, ServeError> {
            self.state
                .lock()
                .clone()
                .ok_or_else(|| ServeError::Remote("unknown job".into()))
        }

        async fn job_result(&self, _job_id: &str) -> Result<ResultBundle, ServeError> {
            Ok(bundle())
        }
    }

    struct Fixture {
        engine: RemoteEngine,
        fake: Arc<FakeOrchestrator>,
        registry: Arc<TaskRegistry>,
        results: Arc<ResultStore>,
    }

    fn fixture(config: RemoteConfig, fake: FakeOrchestrator) -> Fixture {
        let fake = Arc::new(fake);
        let registry = Arc::new(TaskRegistry::new());
        let results = Arc::new(ResultStore::new(RetentionPolicy::default()));
        let engine = RemoteEngine::new(&config, fake.clone(), registry.clone(), results.clone());
        Fixture {
            engine,
            fake,
            registry,
            results,
        }
    }

    async fn admit(f: &Fixture) -> TaskId {
        admit_with_timeout(f, Duration::from_secs(600)).await
    }

    async fn admit_with_timeout(f: &Fixture, timeout: Duration) -> TaskId {
        let options = ConversionOptions::default();
        let key = canonicalize(&options).unwrap();
        let id = f.registry.create(key.clone(), SubmitMode::Async).task_id;
        f.engine
            .submit(QueuedTask {
                id: id.clone(),
                options: Arc::new(options),
                key,
                sources: vec![DocumentSource::http("https://example.com/a.md")],
                timeout,
            })
            .await
            .unwrap();
        id
    }

    fn callback_config() -> RemoteConfig {
        RemoteConfig {
            callback_token: Some("s3cret".into()),
            self_callback_endpoint: Some("http://me/v1/callback/task/progress".into()),
            completion: CompletionMode::Callback,
            ..RemoteConfig::new("http://orchestrator")
        }
    }

    #[test]
    fn remote_states_map_onto_task_status() {
        assert_eq!(RemoteJobState::Running.task_status(), TaskStatus::Started);
        assert_eq!(RemoteJobState::Canceled.task_status(), TaskStatus::Failure);
        assert_eq!(RemoteJobState::Skipped.task_status(), TaskStatus::Failure);
        assert_eq!(RemoteJobState::Succeeded.task_status(), TaskStatus::Success);
    }

    #[test]
    fn unreadable_ca_certificate_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = RemoteConfig {
            ca_cert_path: Some(dir.path().join("missing.pem")),
            ..RemoteConfig::new("https://orchestrator")
        };
        let err = HttpRemoteOrchestrator::new(&config).err().unwrap();
        assert!(matches!(err, ServeError::InvalidConfig(ref m) if m.contains("missing.pem")));
    }

    #[test]
    fn callback_wire_shape() {
        let cb: ProgressCallback = serde_json::from_value(serde_json::json!({
            "task_id": "t1",
            "progress": {"kind": "update_processed", "num_processed": 2, "num_succeeded": 1, "num_failed": 1}
        }))
        .unwrap();
        assert!(matches!(
            cb.progress,
            ProgressUpdate::UpdateProcessed { num_processed: 2, .. }
        ));
    }

    #[tokio::test]
    async fn rejected_submission_is_a_capacity_error() {
        let f = fixture(
            RemoteConfig::new("http://orchestrator"),
            FakeOrchestrator {
                reject: true,
                ..FakeOrchestrator::default()
            },
        );
        let options = ConversionOptions::default();
        let key = canonicalize(&options).unwrap();
        let id = f.registry.create(key.clone(), SubmitMode::Async).task_id;
        let err = f
            .engine
            .submit(QueuedTask {
                id,
                options: Arc::new(options),
                key,
                sources: vec![],
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Capacity { .. }));
        assert_eq!(f.engine.queue_size(), 0);
    }

    #[tokio::test]
    async fn callbacks_drive_the_task_to_success() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let id = admit(&f).await;
        assert_eq!(
            f.fake.submitted.lock()[0].callback_url.as_deref(),
            Some("http://me/v1/callback/task/progress")
        );
        let cb = |progress| ProgressCallback {
            task_id: id.clone(),
            progress,
        };

        f.engine
            .handle_callback(Some("s3cret"), cb(ProgressUpdate::SetNumDocs { num_docs: 1 }))
            .await
            .unwrap();
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Started);

        f.engine
            .handle_callback(
                Some("s3cret"),
                cb(ProgressUpdate::UpdateProcessed {
                    num_processed: 1,
                    num_succeeded: 1,
                    num_failed: 0,
                    docs_succeeded: vec!["a.md".into()],
                    docs_failed: vec![],
                }),
            )
            .await
            .unwrap();
        assert_eq!(f.registry.get(&id).unwrap().meta.unwrap().num_succeeded, 1);

        let ack = f
            .engine
            .handle_callback(Some("s3cret"), cb(ProgressUpdate::Completed { result: None }))
            .await
            .unwrap();
        assert_eq!(ack, CallbackAck::ack());
        let task = f.registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.result_status, Some(ConversionStatus::Success));
        assert!(f.results.contains(&id));
        assert_eq!(f.engine.queue_size(), 0);
    }

    #[tokio::test]
    async fn callback_without_token_is_unauthorized() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let id = admit(&f).await;
        for bearer in [None, Some("wrong")] {
            let err = f
                .engine
                .handle_callback(
                    bearer,
                    ProgressCallback {
                        task_id: id.clone(),
                        progress: ProgressUpdate::SetNumDocs { num_docs: 1 },
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ServeError::Unauthorized));
        }
    }

    #[tokio::test]
    async fn progress_before_num_docs_is_invalid() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let id = admit(&f).await;
        let err = f
            .engine
            .handle_callback(
                Some("s3cret"),
                ProgressCallback {
                    task_id: id,
                    progress: ProgressUpdate::UpdateProcessed {
                        num_processed: 1,
                        num_succeeded: 1,
                        num_failed: 0,
                        docs_succeeded: vec![],
                        docs_failed: vec![],
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::InvalidProgress(_)));
    }

    #[tokio::test]
    async fn unknown_task_callback_is_not_found() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let err = f
            .engine
            .handle_callback(
                Some("s3cret"),
                ProgressCallback {
                    task_id: TaskId::from("nope"),
                    progress: ProgressUpdate::Failed {
                        error: "x".into(),
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn polling_closes_the_loop() {
        let f = fixture(RemoteConfig::new("http://orchestrator"), FakeOrchestrator::default());
        let id = admit(&f).await;
        assert!(f.fake.submitted.lock()[0].callback_url.is_none());

        *f.fake.state.lock() = Some(RemoteJobStatus {
            state: RemoteJobState::Running,
            meta: Some(TaskMeta::with_docs(1)),
            error: None,
        });
        f.engine.poll_once().await;
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Started);

        *f.fake.state.lock() = Some(RemoteJobStatus {
            state: RemoteJobState::Canceled,
            meta: None,
            error: None,
        });
        f.engine.poll_once().await;
        let task = f.registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.failure.unwrap().kind, FailureKind::Remote);
        assert_eq!(f.engine.queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_callback_job_is_forgotten() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let id = admit_with_timeout(&f, Duration::from_secs(5)).await;
        assert_eq!(f.engine.queue_size(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let task = f.registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.failure.unwrap().kind, FailureKind::Timeout);
        assert_eq!(f.engine.queue_size(), 0);

        // The job reporting back afterwards is acknowledged and dropped.
        let ack = f
            .engine
            .handle_callback(
                Some("s3cret"),
                ProgressCallback {
                    task_id: id.clone(),
                    progress: ProgressUpdate::Completed { result: Some(bundle()) },
                },
            )
            .await
            .unwrap();
        assert_eq!(ack, CallbackAck::ack());
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Failure);
        assert!(!f.results.contains(&id));
        assert_eq!(f.registry.stats().consistency_errors, 0);
    }

    #[tokio::test]
    async fn prune_drops_jobs_of_removed_tasks() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let kept = admit(&f).await;
        let dropped = admit(&f).await;
        f.registry.remove(&dropped);

        assert_eq!(f.engine.prune(), 1);
        assert_eq!(f.engine.queue_size(), 1);
        assert!(f.engine.context().job_id(&kept).is_ok());
    }

    #[tokio::test]
    async fn callback_after_polling_completion_is_acknowledged() {
        let f = fixture(RemoteConfig::new("http://orchestrator"), FakeOrchestrator::default());
        let id = admit(&f).await;
        *f.fake.state.lock() = Some(RemoteJobStatus {
            state: RemoteJobState::Succeeded,
            meta: None,
            error: None,
        });
        f.engine.poll_once().await;
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Success);
        assert!(f.results.contains(&id));

        for progress in [
            ProgressUpdate::Completed { result: None },
            ProgressUpdate::Failed {
                error: "worker lost".into(),
            },
        ] {
            let ack = f
                .engine
                .handle_callback(
                    None,
                    ProgressCallback {
                        task_id: id.clone(),
                        progress,
                    },
                )
                .await
                .unwrap();
            assert_eq!(ack, CallbackAck::ack());
        }
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Success);
        assert!(f.results.contains(&id));
        assert_eq!(f.registry.stats().consistency_errors, 0);
    }

    #[tokio::test]
    async fn duplicate_completion_keeps_the_first_outcome() {
        let f = fixture(callback_config(), FakeOrchestrator::default());
        let id = admit(&f).await;
        let ctx = f.engine.context();
        ctx.fail(&id, TaskFailure::new(FailureKind::Remote, "boom")).unwrap();
        ctx.complete(&id, bundle()).unwrap();
        ctx.fail(&id, TaskFailure::new(FailureKind::Remote, "again")).unwrap();

        let task = f.registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.failure.unwrap().message, "boom");
        assert!(!f.results.contains(&id));
        assert_eq!(f.registry.stats().consistency_errors, 0);
    }
}
