//! Options canonicalisation: a deterministic cache key for pipeline identity.
//!
//! ## Why a hand-written canonical form?
//!
//! Two requests that only differ in per-request toggles must land on the
//! same cached pipeline, and two requests that differ in *any* pipeline
//! setting must not. The key is therefore computed from an explicit allow
//! list ([`PIPELINE_FIELDS`]) rather than from "everything minus a few
//! exclusions": a newly added option that nobody classified makes the
//! exhaustiveness test fail instead of silently collapsing distinct
//! configurations into one cache entry.
//!
//! ## Canonical form
//!
//! ```text
//! options ─ validate ─ serialise ─ keep PIPELINE_FIELDS ─ normalise sets
//!        ─ write JSON with recursively sorted keys ─ SHA-256 ─ hex
//! ```

use super::ConversionOptions;
use crate::error::ServeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};

/// Fields that decide which pipeline gets constructed.
pub const PIPELINE_FIELDS: &[&str] = &[
    "do_ocr",
    "force_ocr",
    "ocr_engine",
    "ocr_lang",
    "pdf_backend",
    "table_mode",
    "pipeline",
    "do_table_structure",
    "include_images",
    "images_scale",
    "image_export_mode",
    "do_code_enrichment",
    "do_formula_enrichment",
    "do_picture_classification",
    "do_picture_description",
    "picture_description_area_threshold",
    "picture_description_local",
    "picture_description_api",
];

/// Fields that only affect a single request and never the pipeline.
pub const VOLATILE_FIELDS: &[&str] = &[
    "from_formats",
    "to_formats",
    "page_range",
    "document_timeout",
    "abort_on_error",
    "return_as_file",
    "md_page_break_placeholder",
];

/// Pipeline-identity fields whose list value is semantically a set.
const SET_FIELDS: &[&str] = &["ocr_lang"];

/// Hex-encoded SHA-256 over the canonical pipeline-identity document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionsKey(String);

impl OptionsKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for OptionsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the pipeline cache key for `options`.
///
/// Fails with [`ServeError::Validation`] before hashing when the options are
/// contradictory.
pub fn canonicalize(options: &ConversionOptions) -> Result<OptionsKey, ServeError> {
    options.validate()?;
    let doc = identity_document(options)?;

    let mut canonical = String::with_capacity(512);
    write_canonical(&Value::Object(doc), &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(OptionsKey(hex))
}

/// The subset of `options` that participates in the key, normalised.
fn identity_document(options: &ConversionOptions) -> Result<Map<String, Value>, ServeError> {
    let Value::Object(all) = serde_json::to_value(options)
        .map_err(|e| ServeError::Internal(format!("options serialisation failed: {e}")))?
    else {
        return Err(ServeError::Internal("options did not serialise to an object".into()));
    };

    let mut doc = Map::new();
    for (name, value) in all {
        if !PIPELINE_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let value = if SET_FIELDS.contains(&name.as_str()) {
            normalise_set(value)
        } else {
            value
        };
        doc.insert(name, value);
    }
    Ok(doc)
}

/// Sort and de-duplicate a list of scalars. Non-lists pass through.
fn normalise_set(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut rendered: Vec<(String, Value)> = items
                .into_iter()
                .map(|v| {
                    let mut s = String::new();
                    write_canonical(&v, &mut s);
                    (s, v)
                })
                .collect();
            rendered.sort_by(|a, b| a.0.cmp(&b.0));
            rendered.dedup_by(|a, b| a.0 == b.0);
            Value::Array(rendered.into_iter().map(|(_, v)| v).collect())
        }
        other => other,
    }
}

/// Serialise `value` as compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{
        ConversionOptions, OcrEngine, OutputFormat, PictureDescriptionApi, TableMode,
    };
    use std::collections::{BTreeMap, HashSet};

    fn key(o: &ConversionOptions) -> OptionsKey {
        canonicalize(o).unwrap()
    }

    // ── Exhaustiveness ───────────────────────────────────────────────────

    #[test]
    fn every_field_is_classified_exactly_once() {
        let mut opts = ConversionOptions::default();
        // Populate the optional fields so they appear with a value.
        opts.ocr_lang = Some(vec!["en".into()]);
        opts.page_range = Some(crate::options::PageRange(1, 2));
        opts.document_timeout = Some(10);
        let Value::Object(map) = serde_json::to_value(&opts).unwrap() else {
            panic!("options must serialise to an object");
        };

        let pipeline: HashSet<&str> = PIPELINE_FIELDS.iter().copied().collect();
        let volatile: HashSet<&str> = VOLATILE_FIELDS.iter().copied().collect();
        assert!(
            pipeline.is_disjoint(&volatile),
            "a field is declared both pipeline and volatile: {:?}",
            pipeline.intersection(&volatile).collect::<Vec<_>>()
        );

        for field in map.keys() {
            assert!(
                pipeline.contains(field.as_str()) || volatile.contains(field.as_str()),
                "option field '{field}' is neither in PIPELINE_FIELDS nor VOLATILE_FIELDS"
            );
        }
        for declared in pipeline.iter().chain(volatile.iter()) {
            assert!(
                map.contains_key(*declared),
                "declared field '{declared}' does not exist on ConversionOptions"
            );
        }
    }

    #[test]
    fn every_pipeline_field_changes_the_key() {
        let base = ConversionOptions::default();
        let k0 = key(&base);
        let variants: Vec<(&str, ConversionOptions)> = vec![
            ("do_ocr", ConversionOptions { do_ocr: false, ..base.clone() }),
            ("force_ocr", ConversionOptions { force_ocr: true, ..base.clone() }),
            ("ocr_engine", ConversionOptions { ocr_engine: OcrEngine::Tesseract, ..base.clone() }),
            ("ocr_lang", ConversionOptions { ocr_lang: Some(vec!["de".into()]), ..base.clone() }),
            (
                "pdf_backend",
                ConversionOptions { pdf_backend: crate::options::PdfBackend::Pypdfium2, ..base.clone() },
            ),
            ("table_mode", ConversionOptions { table_mode: TableMode::Accurate, ..base.clone() }),
            (
                "pipeline",
                ConversionOptions { pipeline: crate::options::PipelineKind::Vlm, ..base.clone() },
            ),
            ("do_table_structure", ConversionOptions { do_table_structure: false, ..base.clone() }),
            ("include_images", ConversionOptions { include_images: false, ..base.clone() }),
            ("images_scale", ConversionOptions { images_scale: 1.0, ..base.clone() }),
            (
                "image_export_mode",
                ConversionOptions {
                    image_export_mode: crate::options::ImageExportMode::Placeholder,
                    ..base.clone()
                },
            ),
            ("do_code_enrichment", ConversionOptions { do_code_enrichment: true, ..base.clone() }),
            ("do_formula_enrichment", ConversionOptions { do_formula_enrichment: true, ..base.clone() }),
            (
                "do_picture_classification",
                ConversionOptions { do_picture_classification: true, ..base.clone() },
            ),
            ("do_picture_description", ConversionOptions { do_picture_description: true, ..base.clone() }),
            (
                "picture_description_area_threshold",
                ConversionOptions { picture_description_area_threshold: 0.5, ..base.clone() },
            ),
            (
                "picture_description_local",
                ConversionOptions {
                    picture_description_local: Some(crate::options::PictureDescriptionLocal {
                        repo_id: "ibm-granite/granite-vision-3.1-2b-preview".into(),
                        prompt: "Describe.".into(),
                        generation_config: Map::new(),
                    }),
                    ..base.clone()
                },
            ),
            (
                "picture_description_api",
                ConversionOptions {
                    picture_description_api: Some(PictureDescriptionApi {
                        url: "http://localhost:11434/v1/chat/completions".into(),
                        headers: BTreeMap::new(),
                        params: Map::new(),
                        timeout: 20.0,
                        prompt: "Describe.".into(),
                    }),
                    ..base.clone()
                },
            ),
        ];
        assert_eq!(variants.len(), PIPELINE_FIELDS.len());
        for (name, v) in variants {
            assert_ne!(key(&v), k0, "changing '{name}' must change the key");
        }
    }

    // ── Determinism and exclusions ───────────────────────────────────────

    #[test]
    fn key_is_deterministic() {
        let o = ConversionOptions::default();
        assert_eq!(key(&o), key(&o.clone()));
        assert_eq!(key(&o).as_str().len(), 64);
    }

    #[test]
    fn volatile_fields_do_not_change_the_key() {
        let base = ConversionOptions::default();
        let varied = ConversionOptions {
            abort_on_error: true,
            return_as_file: true,
            to_formats: vec![OutputFormat::Json, OutputFormat::Html],
            from_formats: vec![crate::options::InputFormat::Pdf],
            page_range: Some(crate::options::PageRange(3, 4)),
            document_timeout: Some(30),
            md_page_break_placeholder: "<!-- page -->".into(),
            ..base.clone()
        };
        assert_eq!(key(&base), key(&varied));
    }

    #[test]
    fn ocr_languages_are_a_set() {
        let a = ConversionOptions::builder().ocr_lang(["en", "fr"]).build().unwrap();
        let b = ConversionOptions::builder().ocr_lang(["fr", "en", "en"]).build().unwrap();
        let c = ConversionOptions::builder().ocr_lang(["en", "de"]).build().unwrap();
        assert_eq!(key(&a), key(&b));
        assert_ne!(key(&a), key(&c));
    }

    #[test]
    fn nested_map_order_is_irrelevant() {
        let mut p1 = Map::new();
        p1.insert("model".into(), Value::from("granite"));
        p1.insert("max_completion_tokens".into(), Value::from(200));
        let mut p2 = Map::new();
        p2.insert("max_completion_tokens".into(), Value::from(200));
        p2.insert("model".into(), Value::from("granite"));
        let api = |params| PictureDescriptionApi {
            url: "http://localhost:8000/v1/chat/completions".into(),
            headers: BTreeMap::new(),
            params,
            timeout: 20.0,
            prompt: "Describe.".into(),
        };
        let a = ConversionOptions::builder().picture_description_api(api(p1)).build().unwrap();
        let b = ConversionOptions::builder().picture_description_api(api(p2)).build().unwrap();
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn invalid_options_never_produce_a_key() {
        let o = ConversionOptions {
            do_ocr: false,
            force_ocr: true,
            ..ConversionOptions::default()
        };
        assert!(matches!(canonicalize(&o), Err(ServeError::Validation(_))));
    }

    #[test]
    fn canonical_writer_sorts_keys() {
        let v = serde_json::json!({"b": 1, "a": {"d": [2, 1], "c": null}});
        let mut s = String::new();
        write_canonical(&v, &mut s);
        assert_eq!(s, r#"{"a":{"c":null,"d":[2,1]},"b":1}"#);
    }
}
