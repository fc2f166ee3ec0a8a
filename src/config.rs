//! Server configuration.
//!
//! Every orchestration knob lives in one [`ServeConfig`], built via its
//! [`ServeConfigBuilder`]. Components receive the config (or the slice of it
//! they need) at construction time; nothing reads the environment at runtime.
//! The binary maps CLI flags and `DOCSERVE_*` variables onto the builder.

use crate::error::ServeError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a docserve instance.
///
/// Built via [`ServeConfig::builder()`] or using [`ServeConfig::default()`].
///
/// # Example
/// ```rust
/// use docserve::ServeConfig;
/// use std::time::Duration;
///
/// let config = ServeConfig::builder()
///     .num_workers(4)
///     .pipeline_cache_capacity(3)
///     .max_sync_wait(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// assert_eq!(config.num_workers, 4);
/// ```
#[derive(Clone)]
pub struct ServeConfig {
    /// Maximum number of constructed pipelines kept alive. Default: 2.
    ///
    /// Pipelines hold loaded models, so each one costs real memory. Two
    /// covers the common case of one default configuration plus one variant.
    pub pipeline_cache_capacity: usize,

    /// Number of local workers executing tasks in parallel. Default: 2.
    pub num_workers: usize,

    /// Maximum number of admitted tasks waiting for a local worker.
    /// Default: 10 000. Submissions beyond this fail with a capacity error.
    pub queue_capacity: usize,

    /// Ceiling on the processing time of one task. Default: 7 days.
    ///
    /// A per-request `document_timeout` may lower it but never raise it.
    pub max_document_timeout: Duration,

    /// Upper bound for synchronous conversion calls. Default: 120 s.
    ///
    /// When it elapses the call returns the task handle instead of failing.
    pub max_sync_wait: Duration,

    /// Delete a result shortly after its first successful read. Default: true.
    pub single_use_results: bool,

    /// Grace delay between first read and deletion of a single-use result.
    /// Default: 300 s.
    pub result_removal_delay: Duration,

    /// Absolute retention for results regardless of reads. Default: none.
    pub result_max_retention: Option<Duration>,

    /// How often the retention sweeper runs. Default: 60 s.
    pub sweep_interval: Duration,

    /// Timeout for fetching HTTP sources. Default: 120 s.
    pub download_timeout: Duration,

    /// Which execution engine drives admitted tasks. Default: local.
    pub engine: EngineConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            pipeline_cache_capacity: 2,
            num_workers: 2,
            queue_capacity: 10_000,
            max_document_timeout: Duration::from_secs(3600 * 24 * 7),
            max_sync_wait: Duration::from_secs(120),
            single_use_results: true,
            result_removal_delay: Duration::from_secs(300),
            result_max_retention: None,
            sweep_interval: Duration::from_secs(60),
            download_timeout: Duration::from_secs(120),
            engine: EngineConfig::Local,
        }
    }
}

impl fmt::Debug for ServeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeConfig")
            .field("pipeline_cache_capacity", &self.pipeline_cache_capacity)
            .field("num_workers", &self.num_workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_document_timeout", &self.max_document_timeout)
            .field("max_sync_wait", &self.max_sync_wait)
            .field("single_use_results", &self.single_use_results)
            .field("result_removal_delay", &self.result_removal_delay)
            .field("result_max_retention", &self.result_max_retention)
            .field("engine", &self.engine)
            .finish()
    }
}

impl ServeConfig {
    /// Create a new builder for `ServeConfig`.
    pub fn builder() -> ServeConfigBuilder {
        ServeConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ServeConfig`].
#[derive(Debug)]
pub struct ServeConfigBuilder {
    config: ServeConfig,
}

impl ServeConfigBuilder {
    pub fn pipeline_cache_capacity(mut self, n: usize) -> Self {
        self.config.pipeline_cache_capacity = n.max(1);
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n.max(1);
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n.max(1);
        self
    }

    pub fn max_document_timeout(mut self, d: Duration) -> Self {
        self.config.max_document_timeout = d;
        self
    }

    pub fn max_sync_wait(mut self, d: Duration) -> Self {
        self.config.max_sync_wait = d;
        self
    }

    pub fn single_use_results(mut self, v: bool) -> Self {
        self.config.single_use_results = v;
        self
    }

    pub fn result_removal_delay(mut self, d: Duration) -> Self {
        self.config.result_removal_delay = d;
        self
    }

    pub fn result_max_retention(mut self, d: Option<Duration>) -> Self {
        self.config.result_max_retention = d;
        self
    }

    pub fn sweep_interval(mut self, d: Duration) -> Self {
        self.config.sweep_interval = d;
        self
    }

    pub fn download_timeout(mut self, d: Duration) -> Self {
        self.config.download_timeout = d;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServeConfig, ServeError> {
        let c = &self.config;
        if c.num_workers == 0 {
            return Err(ServeError::InvalidConfig("num_workers must be ≥ 1".into()));
        }
        if c.pipeline_cache_capacity == 0 {
            return Err(ServeError::InvalidConfig(
                "pipeline_cache_capacity must be ≥ 1".into(),
            ));
        }
        if c.max_document_timeout.is_zero() {
            return Err(ServeError::InvalidConfig(
                "max_document_timeout must be > 0".into(),
            ));
        }
        if c.sweep_interval.is_zero() {
            return Err(ServeError::InvalidConfig("sweep_interval must be > 0".into()));
        }
        if let EngineConfig::Remote(remote) = &c.engine {
            remote.validate()?;
        }
        Ok(self.config)
    }
}

// ── Engine selection ─────────────────────────────────────────────────────

/// Which execution engine runs admitted tasks.
#[derive(Debug, Clone, Default)]
pub enum EngineConfig {
    /// In-process worker pool.
    #[default]
    Local,
    /// Delegate to an external job orchestrator.
    Remote(RemoteConfig),
}

/// Connection settings for the remote-orchestrated engine.
#[derive(Clone)]
pub struct RemoteConfig {
    /// Base URL of the external orchestrator's job API.
    pub endpoint: String,
    /// Bearer token sent with every outbound request.
    pub token: Option<String>,
    /// PEM file with an extra trust anchor for the orchestrator's TLS
    /// certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// Bearer token the orchestrator must present on progress callbacks.
    pub callback_token: Option<String>,
    /// Public URL of this server's callback endpoint, handed to the
    /// orchestrator with every job.
    pub self_callback_endpoint: Option<String>,
    /// How completion is observed.
    pub completion: CompletionMode,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            ca_cert_path: None,
            callback_token: None,
            self_callback_endpoint: None,
            completion: CompletionMode::default(),
        }
    }

    fn validate(&self) -> Result<(), ServeError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ServeError::InvalidConfig(format!(
                "remote endpoint must be an HTTP(S) URL, got '{}'",
                self.endpoint
            )));
        }
        match self.completion {
            CompletionMode::Callback if self.callback_token.is_none() => {
                Err(ServeError::InvalidConfig(
                    "callback completion requires a callback token".into(),
                ))
            }
            CompletionMode::Polling { interval } if interval.is_zero() => Err(
                ServeError::InvalidConfig("polling interval must be > 0".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_cert_path", &self.ca_cert_path)
            .field("callback_token", &self.callback_token.as_ref().map(|_| "<redacted>"))
            .field("self_callback_endpoint", &self.self_callback_endpoint)
            .field("completion", &self.completion)
            .finish()
    }
}

/// How the remote engine learns about job progress and completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The orchestrator calls back into this server.
    Callback,
    /// This server polls the orchestrator's job status API.
    Polling { interval: Duration },
}

impl Default for CompletionMode {
    fn default() -> Self {
        CompletionMode::Polling {
            interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let c = ServeConfig::builder().build().unwrap();
        assert_eq!(c.pipeline_cache_capacity, 2);
        assert_eq!(c.num_workers, 2);
        assert!(c.single_use_results);
        assert_eq!(c.result_removal_delay, Duration::from_secs(300));
        assert_eq!(c.max_sync_wait, Duration::from_secs(120));
    }

    #[test]
    fn zero_workers_are_clamped() {
        let c = ServeConfig::builder().num_workers(0).build().unwrap();
        assert_eq!(c.num_workers, 1);
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = ServeConfig::builder()
            .max_document_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ServeError::InvalidConfig(_)));
    }

    #[test]
    fn remote_requires_http_endpoint() {
        let err = ServeConfig::builder()
            .engine(EngineConfig::Remote(RemoteConfig::new("ftp://nope")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("HTTP"), "got: {err}");
    }

    #[test]
    fn callback_mode_requires_token() {
        let mut remote = RemoteConfig::new("https://jobs.internal");
        remote.completion = CompletionMode::Callback;
        assert!(ServeConfig::builder()
            .engine(EngineConfig::Remote(remote.clone()))
            .build()
            .is_err());
        remote.callback_token = Some("s3cret".into());
        assert!(ServeConfig::builder()
            .engine(EngineConfig::Remote(remote))
            .build()
            .is_ok());
    }

    #[test]
    fn debug_redacts_tokens() {
        let mut remote = RemoteConfig::new("https://jobs.internal");
        remote.token = Some("top-secret".into());
        let s = format!("{remote:?}");
        assert!(!s.contains("top-secret"));
        assert!(s.contains("<redacted>"));
    }
}
