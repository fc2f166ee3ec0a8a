//! Output types returned by a finished conversion task.
//!
//! A [`ResultBundle`] holds one [`DocumentResult`] per input, in input
//! order, plus the task-level status and timings. Callers receive it either
//! as a single JSON response ([`ConvertDocumentResponse`]) or, when more than
//! one artifact is produced, as a zip archive with one file per
//! (document, output format).

use crate::error::{DocumentError, ServeError};
use crate::options::OutputFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

/// Outcome of converting one document, or of a whole task.
///
/// For a task, `PartialSuccess` is the "third outcome": the registry records
/// `success`, the bundle records that some inputs failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Success,
    PartialSuccess,
    Skipped,
    Failure,
}

impl ConversionStatus {
    /// Overall status from per-document outcomes.
    ///
    /// | succeeded | failed | skipped | status |
    /// |-----------|--------|---------|--------|
    /// | 0 | 0 | any | skipped |
    /// | 0 | ≥1 | any | failure |
    /// | ≥1 | 0 | 0 | success |
    /// | ≥1 | otherwise | | partial_success |
    pub fn aggregate(documents: &[DocumentResult]) -> Self {
        let count = |s: ConversionStatus| documents.iter().filter(|d| d.status == s).count();
        let succeeded = count(ConversionStatus::Success);
        let failed = count(ConversionStatus::Failure);
        let skipped = count(ConversionStatus::Skipped);
        match (succeeded, failed, skipped) {
            (0, 0, _) => ConversionStatus::Skipped,
            (0, _, _) => ConversionStatus::Failure,
            (_, 0, 0) => ConversionStatus::Success,
            _ => ConversionStatus::PartialSuccess,
        }
    }
}

/// Rendered outputs of one document; only requested formats are filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub md_content: Option<String>,
    pub json_content: Option<Value>,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub doctags_content: Option<String>,
}

impl DocumentContent {
    /// Body of one output format, ready to be written to a file.
    pub fn rendered(&self, format: OutputFormat) -> Option<Vec<u8>> {
        match format {
            OutputFormat::Md => self.md_content.clone().map(String::into_bytes),
            OutputFormat::Json => self
                .json_content
                .as_ref()
                .and_then(|v| serde_json::to_vec_pretty(v).ok()),
            OutputFormat::Html => self.html_content.clone().map(String::into_bytes),
            OutputFormat::Text => self.text_content.clone().map(String::into_bytes),
            OutputFormat::Doctags => self.doctags_content.clone().map(String::into_bytes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &DocumentContent::default()
    }
}

/// Result for a single input document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    pub filename: String,
    /// `success`, `failure` or `skipped` (never reached after an abort).
    pub status: ConversionStatus,
    #[serde(flatten)]
    pub content: DocumentContent,
    pub errors: Vec<DocumentError>,
    /// Wall-clock seconds spent on this document.
    pub processing_time: f64,
}

impl DocumentResult {
    pub fn success(filename: impl Into<String>, content: DocumentContent, secs: f64) -> Self {
        Self {
            filename: filename.into(),
            status: ConversionStatus::Success,
            content,
            errors: Vec::new(),
            processing_time: secs,
        }
    }

    pub fn failure(filename: impl Into<String>, error: DocumentError, secs: f64) -> Self {
        Self {
            filename: filename.into(),
            status: ConversionStatus::Failure,
            content: DocumentContent::default(),
            errors: vec![error],
            processing_time: secs,
        }
    }

    pub fn skipped(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: ConversionStatus::Skipped,
            content: DocumentContent::default(),
            errors: Vec::new(),
            processing_time: 0.0,
        }
    }
}

/// Everything a finished task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub status: ConversionStatus,
    pub documents: Vec<DocumentResult>,
    /// All document errors, flattened in input order.
    pub errors: Vec<DocumentError>,
    /// Wall-clock seconds for the whole task.
    pub processing_time: f64,
    /// Named phase timings in seconds, summed over documents.
    pub timings: BTreeMap<String, f64>,
    pub to_formats: Vec<OutputFormat>,
    pub return_as_file: bool,
}

/// Single-document JSON response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertDocumentResponse {
    pub document: DocumentBody,
    pub status: ConversionStatus,
    pub errors: Vec<DocumentError>,
    pub processing_time: f64,
    pub timings: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBody {
    pub filename: String,
    #[serde(flatten)]
    pub content: DocumentContent,
}

impl ResultBundle {
    /// Assemble a bundle from per-document results.
    pub fn assemble(
        documents: Vec<DocumentResult>,
        processing_time: f64,
        timings: BTreeMap<String, f64>,
        to_formats: Vec<OutputFormat>,
        return_as_file: bool,
    ) -> Self {
        let status = ConversionStatus::aggregate(&documents);
        let errors = documents
            .iter()
            .flat_map(|d| d.errors.iter().cloned())
            .collect();
        Self {
            status,
            documents,
            errors,
            processing_time,
            timings,
            to_formats,
            return_as_file,
        }
    }

    /// `true` when the result is delivered as a zip archive.
    pub fn is_archive(&self) -> bool {
        self.return_as_file || self.documents.len() > 1
    }

    /// The single-document JSON body, or `None` when an archive applies.
    pub fn single_response(&self) -> Option<ConvertDocumentResponse> {
        if self.is_archive() {
            return None;
        }
        let doc = self.documents.first()?;
        Some(ConvertDocumentResponse {
            document: DocumentBody {
                filename: doc.filename.clone(),
                content: doc.content.clone(),
            },
            status: self.status,
            errors: self.errors.clone(),
            processing_time: self.processing_time,
            timings: self.timings.clone(),
        })
    }

    /// One `(file name, body)` per successful document and requested format.
    pub fn artifacts(&self) -> Vec<(String, Vec<u8>)> {
        let mut used: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for doc in &self.documents {
            if doc.status != ConversionStatus::Success {
                continue;
            }
            let stem = unique_stem(file_stem(&doc.filename), &mut used);
            for format in &self.to_formats {
                if let Some(body) = doc.content.rendered(*format) {
                    out.push((format!("{stem}.{}", format.extension()), body));
                }
            }
        }
        out
    }

    /// Render the artifacts as a deflate-compressed zip archive.
    pub fn to_zip(&self) -> Result<Vec<u8>, ServeError> {
        let zip_err = |e: zip::result::ZipError| ServeError::Internal(format!("zip: {e}"));
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in self.artifacts() {
            writer.start_file(name, options).map_err(zip_err)?;
            writer
                .write_all(&body)
                .map_err(|e| ServeError::Internal(format!("zip: {e}")))?;
        }
        let cursor = writer.finish().map_err(zip_err)?;
        Ok(cursor.into_inner())
    }
}

fn file_stem(filename: &str) -> &str {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ if base.is_empty() => "document",
        _ => base,
    }
}

fn unique_stem(stem: &str, used: &mut HashSet<String>) -> String {
    let mut candidate = stem.to_string();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{stem}-{n}");
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn ok(name: &str, md: &str) -> DocumentResult {
        DocumentResult::success(
            name,
            DocumentContent {
                md_content: Some(md.into()),
                ..DocumentContent::default()
            },
            0.1,
        )
    }

    fn failed(name: &str) -> DocumentResult {
        DocumentResult::failure(
            name,
            DocumentError::ConversionFailed {
                filename: name.into(),
                detail: "bad".into(),
            },
            0.1,
        )
    }

    fn bundle(docs: Vec<DocumentResult>) -> ResultBundle {
        ResultBundle::assemble(docs, 1.0, BTreeMap::new(), vec![OutputFormat::Md], false)
    }

    #[test]
    fn aggregate_status_rules() {
        assert_eq!(bundle(vec![ok("a", "x")]).status, ConversionStatus::Success);
        assert_eq!(bundle(vec![failed("a")]).status, ConversionStatus::Failure);
        assert_eq!(
            bundle(vec![ok("a", "x"), failed("b"), ok("c", "y")]).status,
            ConversionStatus::PartialSuccess
        );
        assert_eq!(
            bundle(vec![ok("a", "x"), failed("b"), DocumentResult::skipped("c")]).status,
            ConversionStatus::PartialSuccess
        );
        assert_eq!(
            bundle(vec![DocumentResult::skipped("a")]).status,
            ConversionStatus::Skipped
        );
        assert_eq!(bundle(vec![]).status, ConversionStatus::Skipped);
    }

    #[test]
    fn errors_are_flattened() {
        let b = bundle(vec![ok("a", "x"), failed("b")]);
        assert_eq!(b.errors.len(), 1);
        assert_eq!(b.errors[0].source_name(), "b");
    }

    #[test]
    fn single_document_gets_json_response() {
        let b = bundle(vec![ok("a.md", "# A\n")]);
        let resp = b.single_response().unwrap();
        assert_eq!(resp.document.filename, "a.md");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["document"]["md_content"], "# A\n");
        assert_eq!(v["status"], "success");
    }

    #[test]
    fn multiple_documents_become_an_archive() {
        let b = bundle(vec![ok("a.md", "A"), ok("dir/a.md", "B"), failed("c.md")]);
        assert!(b.is_archive());
        assert!(b.single_response().is_none());

        let names: Vec<String> = b.artifacts().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.md".to_string(), "a-2.md".to_string()]);

        let bytes = b.to_zip().unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut body = String::new();
        archive
            .by_name("a-2.md")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "B");
    }

    #[test]
    fn return_as_file_forces_archive() {
        let mut b = bundle(vec![ok("a.md", "A")]);
        b.return_as_file = true;
        assert!(b.is_archive());
    }

    #[test]
    fn file_stem_handles_odd_names() {
        assert_eq!(file_stem("report.final.pdf"), "report.final");
        assert_eq!(file_stem("/tmp/x/notes.md"), "notes");
        assert_eq!(file_stem(".hidden"), ".hidden");
        assert_eq!(file_stem("README"), "README");
        assert_eq!(file_stem(""), "document");
    }
}
