//! # docserve
//!
//! Document conversion as a network service: admission, queuing, pipeline
//! caching, status distribution and result lifecycle around a pluggable
//! conversion engine.
//!
//! ## Why this crate?
//!
//! Converting a document is the easy part. Serving conversions means
//! keeping expensive pipelines alive and shared, bounding how long work may
//! run, telling many clients about progress without stalling the workers,
//! and handing results out exactly as long as they are wanted. This crate is
//! that orchestration layer; the conversion itself is a
//! [`DocumentConverter`] you plug in (a lightweight Markdown/HTML one ships
//! built in).
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Admit     validate options, canonicalise to a cache key, register `pending`
//!  ├─ 2. Dispatch  local worker pool or remote orchestrator
//!  ├─ 3. Acquire   shared pipeline from the singleflight LRU cache
//!  ├─ 4. Convert   per input, on the blocking pool; watchdog bounds the task
//!  ├─ 5. Publish   every transition fans out to pollers and subscribers
//!  └─ 6. Deliver   result bundle (JSON or zip), single-use or retained
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docserve::{DocumentSource, Orchestrator, ServeConfig, SyncOutcome, TextConverter};
//! use docserve::options::ConversionOptions;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(ServeConfig::default(), Arc::new(TextConverter))?;
//!     orchestrator.start().await;
//!
//!     let source = DocumentSource::from_bytes("notes.md", b"# Notes\n\nHello");
//!     match orchestrator
//!         .convert_sync(ConversionOptions::default(), vec![source], None)
//!         .await?
//!     {
//!         SyncOutcome::Completed { bundle, .. } => {
//!             println!("{:?}", bundle.documents[0].content.md_content)
//!         }
//!         other => eprintln!("not done: {:?}", other.task().task_status),
//!     }
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docserve` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! docserve = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod options;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod results;
pub mod server;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{CompletionMode, EngineConfig, RemoteConfig, ServeConfig, ServeConfigBuilder};
pub use distributor::{StatusDistributor, TaskEventStream};
pub use engine::{ProgressCallback, ProgressUpdate, RemoteOrchestrator};
pub use error::{DocumentError, ServeError};
pub use options::{canonicalize, ConversionOptions, OptionsKey};
pub use orchestrator::{Orchestrator, OrchestratorStats, SyncOutcome};
pub use output::{ConversionStatus, DocumentResult, ResultBundle};
pub use pipeline::text::TextConverter;
pub use pipeline::{ConversionPipeline, ConvertedDocument, DocumentConverter, DocumentSource};
pub use server::{build_router, start_server, ApiState};
pub use task::{TaskEvent, TaskId, TaskMeta, TaskSnapshot, TaskStatus};
