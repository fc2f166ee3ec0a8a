//! Conversion pipelines: the contracts the orchestrator needs from the
//! conversion engine, plus the pieces that sit around it.
//!
//! The orchestrator never converts anything itself. It asks a
//! [`DocumentConverter`] to construct a [`ConversionPipeline`] for a given
//! set of options (expensive, done once per cache key) and then runs that
//! pipeline on each input (blocking, done on the blocking thread pool).
//!
//! ## Data Flow
//!
//! ```text
//! DocumentSource ──▶ source ──▶ SourceDocument ──▶ pipeline.convert ──▶ ConvertedDocument
//!  (url/base64)     (fetch)     (bytes+format)     (cached, shared)      (per-format content)
//! ```
//!
//! 1. [`source`]: fetch or decode the input into raw bytes plus a format
//! 2. [`cache`]: bounded, singleflight cache of constructed pipelines
//! 3. [`text`]: a built-in converter for Markdown, plain text and HTML

pub mod cache;
pub mod source;
pub mod text;

use crate::error::{DocumentError, ServeError};
use crate::options::ConversionOptions;
use crate::output::DocumentContent;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use cache::{CacheStats, PipelineCache, PipelineLease};
pub use source::{DocumentSource, SourceDocument, SourceFetcher};

/// A constructed pipeline. Immutable after construction and shared by every
/// task using the same options key, so `convert` takes `&self`.
pub trait ConversionPipeline: Send + Sync {
    /// Convert one document. Called from a blocking thread; may take minutes.
    fn convert(
        &self,
        document: &SourceDocument,
        options: &ConversionOptions,
    ) -> Result<ConvertedDocument, DocumentError>;
}

/// Factory for pipelines.
pub trait DocumentConverter: Send + Sync {
    /// Construct a pipeline for `options`. Called from a blocking thread,
    /// at most once per cache key at a time.
    fn build_pipeline(
        &self,
        options: &ConversionOptions,
    ) -> Result<Arc<dyn ConversionPipeline>, ServeError>;
}

/// Output of a successful conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertedDocument {
    pub content: DocumentContent,
    /// Named phase timings in seconds.
    pub timings: BTreeMap<String, f64>,
}
