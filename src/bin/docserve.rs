//! CLI binary for docserve.
//!
//! A thin shim over the library crate that maps CLI flags to `ServeConfig`,
//! starts the orchestrator and serves the HTTP API until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use docserve::{
    start_server, ApiState, CompletionMode, EngineConfig, Orchestrator, RemoteConfig,
    ServeConfig, TextConverter,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Local engine, defaults (2 workers, 2 cached pipelines)
  docserve

  # Bigger pool, persistent results kept for a day
  docserve --workers 8 --cache-capacity 4 --no-single-use-results --result-max-retention 86400

  # Delegate to a remote orchestrator, completion by polling
  docserve --engine remote --remote-endpoint https://jobs.internal/api --remote-token $TOKEN

  # Remote orchestrator calling back into this server
  docserve --engine remote --remote-endpoint https://jobs.internal/api \
           --completion callback --callback-token $CB_TOKEN \
           --self-callback-url http://docserve:5001/v1/callback/task/progress

  # Convert synchronously
  curl -s localhost:5001/v1/convert/source -H 'content-type: application/json' \
       -d '{"http_sources":[{"url":"https://example.com/readme.md"}]}'

ENVIRONMENT VARIABLES:
  Every flag can also be set as DOCSERVE_<FLAG>, e.g. DOCSERVE_WORKERS=4.
  RUST_LOG overrides --verbose / --quiet.
"#;

/// Serve document conversions over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "docserve",
    version,
    about = "Serve document conversions over HTTP",
    long_about = "Document conversion as a network service: admission, queuing, pipeline \
caching, status long-polling and WebSocket subscriptions, and single-use or retained results. \
Runs tasks on a local worker pool or delegates them to a remote job orchestrator.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "DOCSERVE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(short, long, env = "DOCSERVE_PORT", default_value_t = 5001)]
    port: u16,

    /// Local worker pool size.
    #[arg(short, long, env = "DOCSERVE_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Maximum number of cached pipelines.
    #[arg(long, env = "DOCSERVE_CACHE_CAPACITY", default_value_t = 2)]
    cache_capacity: usize,

    /// Maximum number of tasks waiting for a worker.
    #[arg(long, env = "DOCSERVE_QUEUE_CAPACITY", default_value_t = 10_000)]
    queue_capacity: usize,

    /// Ceiling on one task's processing time, in seconds.
    #[arg(long, env = "DOCSERVE_MAX_DOCUMENT_TIMEOUT", default_value_t = 604_800)]
    max_document_timeout: u64,

    /// Longest a synchronous request waits before answering 202, in seconds.
    #[arg(long, env = "DOCSERVE_MAX_SYNC_WAIT", default_value_t = 120)]
    max_sync_wait: u64,

    /// Keep results after they are read.
    #[arg(long, env = "DOCSERVE_NO_SINGLE_USE_RESULTS")]
    no_single_use_results: bool,

    /// Grace period between the first read of a result and its deletion, in seconds.
    #[arg(long, env = "DOCSERVE_RESULT_REMOVAL_DELAY", default_value_t = 300)]
    result_removal_delay: u64,

    /// Delete results this many seconds after they were stored.
    #[arg(long, env = "DOCSERVE_RESULT_MAX_RETENTION")]
    result_max_retention: Option<u64>,

    /// HTTP source download timeout in seconds.
    #[arg(long, env = "DOCSERVE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Execution engine.
    #[arg(long, env = "DOCSERVE_ENGINE", value_enum, default_value = "local")]
    engine: EngineArg,

    /// Base URL of the remote orchestrator's job API.
    #[arg(long, env = "DOCSERVE_REMOTE_ENDPOINT", required_if_eq("engine", "remote"))]
    remote_endpoint: Option<String>,

    /// Bearer token for requests to the remote orchestrator.
    #[arg(long, env = "DOCSERVE_REMOTE_TOKEN", hide_env_values = true)]
    remote_token: Option<String>,

    /// PEM file with an extra CA certificate for the remote orchestrator.
    #[arg(long, env = "DOCSERVE_REMOTE_CA_CERT")]
    remote_ca_cert: Option<PathBuf>,

    /// How remote completion is observed.
    #[arg(long, env = "DOCSERVE_COMPLETION", value_enum, default_value = "polling")]
    completion: CompletionArg,

    /// Polling interval for remote job status, in seconds.
    #[arg(long, env = "DOCSERVE_POLL_INTERVAL", default_value_t = 5)]
    poll_interval: u64,

    /// Bearer token the remote orchestrator must present on callbacks.
    #[arg(long, env = "DOCSERVE_CALLBACK_TOKEN", hide_env_values = true)]
    callback_token: Option<String>,

    /// Public URL of this server's callback endpoint.
    #[arg(long, env = "DOCSERVE_SELF_CALLBACK_URL")]
    self_callback_url: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCSERVE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCSERVE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum EngineArg {
    Local,
    Remote,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CompletionArg {
    Polling,
    Callback,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli).context("Invalid configuration")?;
    info!("Configuration: {:?}", config);

    let orchestrator = Arc::new(
        Orchestrator::new(config, Arc::new(TextConverter))
            .context("Failed to initialise the orchestrator")?,
    );
    orchestrator.start().await;

    // ── Serve ────────────────────────────────────────────────────────────
    let addr = format!("{}:{}", cli.host, cli.port);
    start_server(&addr, ApiState::new(Arc::clone(&orchestrator)), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await
    .with_context(|| format!("Server on {addr} failed"))?;

    orchestrator.shutdown().await;
    Ok(())
}

/// Map CLI args to `ServeConfig`.
fn build_config(cli: &Cli) -> Result<ServeConfig> {
    let engine = match cli.engine {
        EngineArg::Local => EngineConfig::Local,
        EngineArg::Remote => {
            let endpoint = cli
                .remote_endpoint
                .clone()
                .context("--remote-endpoint is required with --engine remote")?;
            EngineConfig::Remote(RemoteConfig {
                token: cli.remote_token.clone(),
                ca_cert_path: cli.remote_ca_cert.clone(),
                callback_token: cli.callback_token.clone(),
                self_callback_endpoint: cli.self_callback_url.clone(),
                completion: match cli.completion {
                    CompletionArg::Callback => CompletionMode::Callback,
                    CompletionArg::Polling => CompletionMode::Polling {
                        interval: Duration::from_secs(cli.poll_interval.max(1)),
                    },
                },
                ..RemoteConfig::new(endpoint)
            })
        }
    };

    let config = ServeConfig::builder()
        .num_workers(cli.workers)
        .pipeline_cache_capacity(cli.cache_capacity)
        .queue_capacity(cli.queue_capacity)
        .max_document_timeout(Duration::from_secs(cli.max_document_timeout))
        .max_sync_wait(Duration::from_secs(cli.max_sync_wait))
        .single_use_results(!cli.no_single_use_results)
        .result_removal_delay(Duration::from_secs(cli.result_removal_delay))
        .result_max_retention(cli.result_max_retention.map(Duration::from_secs))
        .download_timeout(Duration::from_secs(cli.download_timeout))
        .engine(engine)
        .build()?;
    Ok(config)
}
