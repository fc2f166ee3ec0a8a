//! Conversion options: the per-request description of what to convert and how.
//!
//! [`ConversionOptions`] mixes two kinds of fields:
//!
//! * **Pipeline-identity** fields (OCR, table mode, enrichment models, ...)
//!   decide which pipeline has to be constructed. Two requests that agree on
//!   all of them can share one cached pipeline.
//! * **Volatile** fields (`abort_on_error`, `page_range`, output formats, ...)
//!   only affect how one request is run and never participate in the cache
//!   key.
//!
//! The split lives in [`canonical`], next to the hashing code, so that adding
//! a field here without classifying it there fails the exhaustiveness test.

pub mod canonical;

use crate::error::ServeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use canonical::{canonicalize, OptionsKey, PIPELINE_FIELDS, VOLATILE_FIELDS};

/// Options for one conversion request.
///
/// Deserialises from partial JSON: every missing field takes its default.
///
/// # Example
/// ```rust
/// use docserve::options::{ConversionOptions, OutputFormat, TableMode};
///
/// let opts = ConversionOptions::builder()
///     .to_formats(vec![OutputFormat::Md, OutputFormat::Json])
///     .table_mode(TableMode::Accurate)
///     .abort_on_error(true)
///     .build()
///     .unwrap();
/// assert!(opts.abort_on_error);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    // ── Formats ──────────────────────────────────────────────────────────
    /// Input formats accepted for this request.
    pub from_formats: Vec<InputFormat>,
    /// Output formats to render for every converted document.
    pub to_formats: Vec<OutputFormat>,
    /// How images are represented in the output.
    pub image_export_mode: ImageExportMode,

    // ── OCR ──────────────────────────────────────────────────────────────
    pub do_ocr: bool,
    /// Replace existing text with OCR output. Requires `do_ocr`.
    pub force_ocr: bool,
    pub ocr_engine: OcrEngine,
    /// OCR languages. Treated as a set: order and duplicates do not matter.
    pub ocr_lang: Option<Vec<String>>,

    // ── Pipeline ─────────────────────────────────────────────────────────
    pub pdf_backend: PdfBackend,
    pub table_mode: TableMode,
    pub pipeline: PipelineKind,
    pub do_table_structure: bool,
    pub include_images: bool,
    /// Scale factor for extracted images. Must be positive.
    pub images_scale: f64,

    // ── Per-request behaviour ────────────────────────────────────────────
    /// 1-based inclusive page range. Declared order: `[start, end]`.
    pub page_range: Option<PageRange>,
    /// Per-document processing budget in seconds.
    pub document_timeout: Option<u64>,
    /// Stop at the first failing document.
    pub abort_on_error: bool,
    /// Always deliver the result as a zip archive.
    pub return_as_file: bool,
    /// Inserted between pages in Markdown output. Empty means none.
    pub md_page_break_placeholder: String,

    // ── Enrichment ───────────────────────────────────────────────────────
    pub do_code_enrichment: bool,
    pub do_formula_enrichment: bool,
    pub do_picture_classification: bool,
    pub do_picture_description: bool,
    /// Minimum picture area (fraction of the page) to describe. Range: 0–1.
    pub picture_description_area_threshold: f64,
    pub picture_description_local: Option<PictureDescriptionLocal>,
    pub picture_description_api: Option<PictureDescriptionApi>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            from_formats: InputFormat::ALL.to_vec(),
            to_formats: vec![OutputFormat::Md],
            image_export_mode: ImageExportMode::Embedded,
            do_ocr: true,
            force_ocr: false,
            ocr_engine: OcrEngine::default(),
            ocr_lang: None,
            pdf_backend: PdfBackend::default(),
            table_mode: TableMode::default(),
            pipeline: PipelineKind::default(),
            do_table_structure: true,
            include_images: true,
            images_scale: 2.0,
            page_range: None,
            document_timeout: None,
            abort_on_error: false,
            return_as_file: false,
            md_page_break_placeholder: String::new(),
            do_code_enrichment: false,
            do_formula_enrichment: false,
            do_picture_classification: false,
            do_picture_description: false,
            picture_description_area_threshold: 0.05,
            picture_description_local: None,
            picture_description_api: None,
        }
    }
}

impl ConversionOptions {
    /// Create a new builder starting from the defaults.
    pub fn builder() -> ConversionOptionsBuilder {
        ConversionOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Reject malformed or contradictory options.
    ///
    /// Runs before a cache key is ever computed, so a contradictory request
    /// can never alias a valid pipeline.
    pub fn validate(&self) -> Result<(), ServeError> {
        if self.force_ocr && !self.do_ocr {
            return Err(ServeError::Validation(
                "force_ocr requires do_ocr to be enabled".into(),
            ));
        }
        if self.picture_description_local.is_some() && self.picture_description_api.is_some() {
            return Err(ServeError::Validation(
                "picture_description_local and picture_description_api are mutually exclusive"
                    .into(),
            ));
        }
        if !(self.images_scale.is_finite() && self.images_scale > 0.0) {
            return Err(ServeError::Validation(format!(
                "images_scale must be > 0, got {}",
                self.images_scale
            )));
        }
        let t = self.picture_description_area_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(ServeError::Validation(format!(
                "picture_description_area_threshold must be within 0–1, got {t}"
            )));
        }
        if self.from_formats.is_empty() {
            return Err(ServeError::Validation("from_formats must not be empty".into()));
        }
        if self.to_formats.is_empty() {
            return Err(ServeError::Validation("to_formats must not be empty".into()));
        }
        if let Some(range) = &self.page_range {
            range.validate()?;
        }
        if self.document_timeout == Some(0) {
            return Err(ServeError::Validation("document_timeout must be > 0".into()));
        }
        if let Some(api) = &self.picture_description_api {
            if !(api.url.starts_with("http://") || api.url.starts_with("https://")) {
                return Err(ServeError::Validation(format!(
                    "picture_description_api.url must be an HTTP(S) URL, got '{}'",
                    api.url
                )));
            }
        }
        Ok(())
    }

    /// Validate and additionally check the per-request timeout against the
    /// server-wide ceiling.
    pub fn validate_with_limit(&self, max_document_timeout: Duration) -> Result<(), ServeError> {
        self.validate()?;
        if let Some(secs) = self.document_timeout {
            if secs > max_document_timeout.as_secs() {
                return Err(ServeError::Validation(format!(
                    "document_timeout {secs}s exceeds the maximum of {}s",
                    max_document_timeout.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Effective processing budget for a task with these options.
    pub fn effective_timeout(&self, max_document_timeout: Duration) -> Duration {
        self.document_timeout
            .map(Duration::from_secs)
            .unwrap_or(max_document_timeout)
            .min(max_document_timeout)
    }

    /// `true` when `format` is accepted by this request.
    pub fn accepts(&self, format: InputFormat) -> bool {
        self.from_formats.contains(&format)
    }
}

/// Builder for [`ConversionOptions`].
#[derive(Debug)]
pub struct ConversionOptionsBuilder {
    options: ConversionOptions,
}

impl ConversionOptionsBuilder {
    pub fn from_formats(mut self, formats: Vec<InputFormat>) -> Self {
        self.options.from_formats = formats;
        self
    }

    pub fn to_formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.options.to_formats = formats;
        self
    }

    pub fn image_export_mode(mut self, mode: ImageExportMode) -> Self {
        self.options.image_export_mode = mode;
        self
    }

    pub fn do_ocr(mut self, v: bool) -> Self {
        self.options.do_ocr = v;
        self
    }

    pub fn force_ocr(mut self, v: bool) -> Self {
        self.options.force_ocr = v;
        self
    }

    pub fn ocr_engine(mut self, engine: OcrEngine) -> Self {
        self.options.ocr_engine = engine;
        self
    }

    pub fn ocr_lang<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.ocr_lang = Some(langs.into_iter().map(Into::into).collect());
        self
    }

    pub fn pdf_backend(mut self, backend: PdfBackend) -> Self {
        self.options.pdf_backend = backend;
        self
    }

    pub fn table_mode(mut self, mode: TableMode) -> Self {
        self.options.table_mode = mode;
        self
    }

    pub fn pipeline(mut self, kind: PipelineKind) -> Self {
        self.options.pipeline = kind;
        self
    }

    pub fn do_table_structure(mut self, v: bool) -> Self {
        self.options.do_table_structure = v;
        self
    }

    pub fn include_images(mut self, v: bool) -> Self {
        self.options.include_images = v;
        self
    }

    pub fn images_scale(mut self, scale: f64) -> Self {
        self.options.images_scale = scale;
        self
    }

    pub fn page_range(mut self, start: u32, end: u32) -> Self {
        self.options.page_range = Some(PageRange(start, end));
        self
    }

    pub fn document_timeout(mut self, secs: u64) -> Self {
        self.options.document_timeout = Some(secs);
        self
    }

    pub fn abort_on_error(mut self, v: bool) -> Self {
        self.options.abort_on_error = v;
        self
    }

    pub fn return_as_file(mut self, v: bool) -> Self {
        self.options.return_as_file = v;
        self
    }

    pub fn md_page_break_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.options.md_page_break_placeholder = placeholder.into();
        self
    }

    pub fn do_code_enrichment(mut self, v: bool) -> Self {
        self.options.do_code_enrichment = v;
        self
    }

    pub fn do_formula_enrichment(mut self, v: bool) -> Self {
        self.options.do_formula_enrichment = v;
        self
    }

    pub fn do_picture_classification(mut self, v: bool) -> Self {
        self.options.do_picture_classification = v;
        self
    }

    pub fn do_picture_description(mut self, v: bool) -> Self {
        self.options.do_picture_description = v;
        self
    }

    pub fn picture_description_area_threshold(mut self, t: f64) -> Self {
        self.options.picture_description_area_threshold = t;
        self
    }

    pub fn picture_description_local(mut self, local: PictureDescriptionLocal) -> Self {
        self.options.picture_description_local = Some(local);
        self
    }

    pub fn picture_description_api(mut self, api: PictureDescriptionApi) -> Self {
        self.options.picture_description_api = Some(api);
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<ConversionOptions, ServeError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Document formats a request may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Docx,
    Pptx,
    Html,
    Image,
    Pdf,
    Asciidoc,
    Md,
    Csv,
    Xlsx,
}

impl InputFormat {
    pub const ALL: [InputFormat; 9] = [
        InputFormat::Docx,
        InputFormat::Pptx,
        InputFormat::Html,
        InputFormat::Image,
        InputFormat::Pdf,
        InputFormat::Asciidoc,
        InputFormat::Md,
        InputFormat::Csv,
        InputFormat::Xlsx,
    ];

    /// Guess the format from a file name or URL path.
    pub fn from_filename(name: &str) -> Option<Self> {
        let name = name.split(['?', '#']).next().unwrap_or(name);
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        let format = match ext.as_str() {
            "docx" | "dotx" | "docm" => InputFormat::Docx,
            "pptx" | "potx" | "pptm" => InputFormat::Pptx,
            "html" | "htm" | "xhtml" => InputFormat::Html,
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "webp" => InputFormat::Image,
            "pdf" => InputFormat::Pdf,
            "adoc" | "asciidoc" | "asc" => InputFormat::Asciidoc,
            "md" | "markdown" | "txt" | "text" => InputFormat::Md,
            "csv" => InputFormat::Csv,
            "xlsx" | "xlsm" => InputFormat::Xlsx,
            _ => return None,
        };
        Some(format)
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputFormat::Docx => "docx",
            InputFormat::Pptx => "pptx",
            InputFormat::Html => "html",
            InputFormat::Image => "image",
            InputFormat::Pdf => "pdf",
            InputFormat::Asciidoc => "asciidoc",
            InputFormat::Md => "md",
            InputFormat::Csv => "csv",
            InputFormat::Xlsx => "xlsx",
        };
        f.write_str(s)
    }
}

/// Output renderings a request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Md,
    Json,
    Html,
    Text,
    Doctags,
}

impl OutputFormat {
    /// File extension used when the output is written into an archive.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Md => "md",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
            OutputFormat::Text => "txt",
            OutputFormat::Doctags => "doctags",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageExportMode {
    Placeholder,
    #[default]
    Embedded,
    Referenced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrEngine {
    #[default]
    Easyocr,
    Tesseract,
    Rapidocr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfBackend {
    Pypdfium2,
    DlparseV1,
    DlparseV2,
    #[default]
    DlparseV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMode {
    #[default]
    Fast,
    Accurate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    #[default]
    Standard,
    Vlm,
}

/// Inclusive, 1-based page range serialised as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange(pub u32, pub u32);

impl PageRange {
    pub fn start(&self) -> u32 {
        self.0
    }

    pub fn end(&self) -> u32 {
        self.1
    }

    fn validate(&self) -> Result<(), ServeError> {
        if self.0 == 0 || self.0 > self.1 {
            return Err(ServeError::Validation(format!(
                "page_range must be 1-based with start <= end, got [{}, {}]",
                self.0, self.1
            )));
        }
        Ok(())
    }
}

/// Describe pictures with a locally loaded vision model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PictureDescriptionLocal {
    pub repo_id: String,
    #[serde(default = "default_picture_prompt")]
    pub prompt: String,
    #[serde(default = "default_generation_config")]
    pub generation_config: Map<String, Value>,
}

/// Describe pictures through an OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PictureDescriptionApi {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Request timeout in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout: f64,
    #[serde(default = "default_picture_prompt")]
    pub prompt: String,
}

fn default_picture_prompt() -> String {
    "Describe this image in a few sentences.".to_string()
}

fn default_generation_config() -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("max_new_tokens".into(), Value::from(200));
    m.insert("do_sample".into(), Value::from(false));
    m
}

fn default_api_timeout() -> f64 {
    20.0
}
