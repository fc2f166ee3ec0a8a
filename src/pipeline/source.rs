//! Source acquisition: turn a request's document sources into raw bytes.
//!
//! ## Why per-source errors?
//!
//! A task may carry many sources. One dead URL must not sink the other
//! inputs, so [`SourceFetcher::fetch`] reports failures as a
//! [`DocumentError`] that the engine records against that input alone.
//!
//! Uploaded files arrive base64-encoded; HTTP sources are downloaded with a
//! bounded timeout and may carry caller-supplied headers (auth tokens,
//! user agent).

use crate::error::{DocumentError, ServeError};
use crate::options::InputFormat;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// A document to fetch over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSource {
    pub url: String,
    /// Extra request headers, e.g. authorization.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// A document uploaded inline as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSource {
    pub base64_string: String,
    pub filename: String,
}

/// One input of a conversion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSource {
    Http(HttpSource),
    File(FileSource),
}

impl DocumentSource {
    pub fn http(url: impl Into<String>) -> Self {
        DocumentSource::Http(HttpSource {
            url: url.into(),
            headers: BTreeMap::new(),
        })
    }

    /// Wrap raw bytes (e.g. a multipart upload) as an inline source.
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        DocumentSource::File(FileSource {
            base64_string: base64::engine::general_purpose::STANDARD.encode(bytes),
            filename: filename.into(),
        })
    }

    /// Human-readable label used in logs and per-document errors.
    pub fn name(&self) -> &str {
        match self {
            DocumentSource::Http(s) => &s.url,
            DocumentSource::File(s) => &s.filename,
        }
    }

    /// Name of the document as it will appear in results.
    pub fn filename(&self) -> String {
        match self {
            DocumentSource::Http(s) => filename_from_url(&s.url),
            DocumentSource::File(s) => s.filename.clone(),
        }
    }
}

/// An acquired document, ready for a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub filename: String,
    /// `None` when neither the name nor the content type identified it.
    pub format: Option<InputFormat>,
    pub bytes: Vec<u8>,
}

impl SourceDocument {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        let format = InputFormat::from_filename(&filename);
        Self {
            filename,
            format,
            bytes,
        }
    }
}

/// Fetches and decodes [`DocumentSource`]s.
#[derive(Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl SourceFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ServeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServeError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    /// Acquire one source.
    pub async fn fetch(&self, source: &DocumentSource) -> Result<SourceDocument, DocumentError> {
        match source {
            DocumentSource::File(file) => decode_file(file),
            DocumentSource::Http(http) => self.download(http).await,
        }
    }

    async fn download(&self, source: &HttpSource) -> Result<SourceDocument, DocumentError> {
        let fail = |detail: String| DocumentError::Acquisition {
            source_name: source.url.clone(),
            detail,
        };
        if !is_url(&source.url) {
            return Err(fail("not an HTTP/HTTPS URL".into()));
        }
        info!("Downloading document from: {}", source.url);

        let headers = build_headers(&source.headers).map_err(fail)?;
        let response = self
            .client
            .get(&source.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    fail(format!("timed out after {}s", self.timeout.as_secs()))
                } else {
                    fail(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;

        let mut document = SourceDocument::new(filename_from_url(&source.url), bytes.to_vec());
        if document.format.is_none() {
            document.format = content_type.as_deref().and_then(format_from_mime);
        }
        debug!(
            "Downloaded {} bytes from {} ({:?})",
            document.bytes.len(),
            source.url,
            document.format
        );
        Ok(document)
    }
}

fn decode_file(file: &FileSource) -> Result<SourceDocument, DocumentError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(file.base64_string.trim())
        .map_err(|e| DocumentError::Acquisition {
            source_name: file.filename.clone(),
            detail: format!("invalid base64: {e}"),
        })?;
    Ok(SourceDocument::new(file.filename.clone(), bytes))
}

fn build_headers(raw: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name '{name}': {e}"))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| format!("invalid header value: {e}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Last non-empty path segment of `url`, or a generic name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(segments) = parsed.path_segments() {
            if let Some(last) = segments.filter(|s| !s.is_empty()).last() {
                return last.to_string();
            }
        }
    }
    "document".to_string()
}

fn format_from_mime(mime: &str) -> Option<InputFormat> {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    let format = match essence {
        "application/pdf" => InputFormat::Pdf,
        "text/html" | "application/xhtml+xml" => InputFormat::Html,
        "text/markdown" | "text/x-markdown" | "text/plain" => InputFormat::Md,
        "text/csv" => InputFormat::Csv,
        "text/asciidoc" => InputFormat::Asciidoc,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            InputFormat::Docx
        }
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            InputFormat::Pptx
        }
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => InputFormat::Xlsx,
        m if m.starts_with("image/") => InputFormat::Image,
        _ => return None,
    };
    Some(format)
}
