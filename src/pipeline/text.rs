//! Built-in converter for text-like inputs: Markdown, plain text and HTML.
//!
//! ## Why ship a converter at all?
//!
//! The orchestrator is engine-agnostic, but a server with no converter
//! cannot serve a single request. This one needs no models or native
//! libraries, so `docserve` works out of the box for lightweight inputs and
//! the test-suite has a real pipeline to drive. Heavier formats (PDF, office
//! documents, images) are reported as unsupported and belong to a
//! [`DocumentConverter`] plugged in by the embedding application.
//!
//! ## Pages
//!
//! A form feed (`\x0c`) separates pages. `page_range` selects a 1-based,
//! inclusive slice of them and `md_page_break_placeholder` is written
//! between the selected pages in the Markdown output.

use super::{ConversionPipeline, ConvertedDocument, DocumentConverter, SourceDocument};
use crate::error::{DocumentError, ServeError};
use crate::options::{ConversionOptions, InputFormat, OutputFormat};
use crate::output::DocumentContent;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const PAGE_BREAK: char = '\x0c';

/// [`DocumentConverter`] producing [`TextPipeline`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextConverter;

impl TextConverter {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentConverter for TextConverter {
    fn build_pipeline(
        &self,
        options: &ConversionOptions,
    ) -> Result<Arc<dyn ConversionPipeline>, ServeError> {
        debug!(
            "Building text pipeline (include_images={})",
            options.include_images
        );
        Ok(Arc::new(TextPipeline {
            include_images: options.include_images,
        }))
    }
}

/// Converts Markdown, plain text and HTML documents.
#[derive(Debug, Clone)]
pub struct TextPipeline {
    /// When off, image links are replaced by their alt text.
    include_images: bool,
}

impl ConversionPipeline for TextPipeline {
    fn convert(
        &self,
        document: &SourceDocument,
        options: &ConversionOptions,
    ) -> Result<ConvertedDocument, DocumentError> {
        let start = Instant::now();
        let filename = &document.filename;
        let format = document.format.ok_or_else(|| DocumentError::UnsupportedFormat {
            filename: filename.clone(),
            format: "unknown".into(),
        })?;

        let raw = std::str::from_utf8(&document.bytes).map_err(|e| {
            DocumentError::ConversionFailed {
                filename: filename.clone(),
                detail: format!("not valid UTF-8: {e}"),
            }
        })?;

        let markdown = match format {
            InputFormat::Md => raw.to_string(),
            InputFormat::Html => html_to_markdown(raw),
            other => {
                return Err(DocumentError::UnsupportedFormat {
                    filename: filename.clone(),
                    format: other.to_string(),
                })
            }
        };

        let pages = select_pages(&markdown, options).ok_or_else(|| {
            DocumentError::ConversionFailed {
                filename: filename.clone(),
                detail: "page_range selects no pages".into(),
            }
        })?;
        let pages: Vec<String> = pages
            .into_iter()
            .map(|(_, text)| {
                if self.include_images {
                    clean_markdown(text)
                } else {
                    clean_markdown(&strip_images(text))
                }
            })
            .collect();

        let content = render(filename, &pages, options);
        let mut timings = BTreeMap::new();
        timings.insert("convert".to_string(), start.elapsed().as_secs_f64());
        Ok(ConvertedDocument { content, timings })
    }
}

// ── Pages ────────────────────────────────────────────────────────────────

/// `(page_no, text)` for every selected page, or `None` when the range
/// selects nothing.
fn select_pages<'a>(text: &'a str, options: &ConversionOptions) -> Option<Vec<(u32, &'a str)>> {
    let all = text.split(PAGE_BREAK).enumerate().map(|(i, p)| (i as u32 + 1, p));
    let selected: Vec<(u32, &str)> = match &options.page_range {
        Some(range) => all
            .filter(|(no, _)| *no >= range.start() && *no <= range.end())
            .collect(),
        None => all.collect(),
    };
    (!selected.is_empty()).then_some(selected)
}

// ── Cleanup rules ────────────────────────────────────────────────────────

/// Normalise a Markdown page: line endings, trailing whitespace, runs of
/// blank lines, invisible characters.
pub fn clean_markdown(input: &str) -> String {
    let s = input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    );
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.lines().map(str::trim_end).collect::<Vec<_>>().join("\n");
    RE_BLANK_LINES.replace_all(&s, "\n\n").trim().to_string()
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());

fn strip_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures| {
            let alt = caps[1].trim();
            if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .to_string()
}

// ── HTML input ───────────────────────────────────────────────────────────

static RE_DROP_BLOCKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>").unwrap());
static RE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]>").unwrap());
static RE_LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").unwrap());
static RE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static RE_BLOCK_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(p|div|ul|ol|table|tr|section|article)>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());

/// Reduce HTML to Markdown: headings, list items and paragraphs survive,
/// every other tag is dropped.
fn html_to_markdown(html: &str) -> String {
    let s = RE_DROP_BLOCKS.replace_all(html, "");
    let s = RE_HEADING.replace_all(&s, |caps: &regex::Captures| {
        let level: usize = caps[1].parse().unwrap_or(1);
        format!("\n\n{} {}\n\n", "#".repeat(level), collapse_ws(&caps[2]))
    });
    let s = RE_LIST_ITEM.replace_all(&s, |caps: &regex::Captures| {
        format!("\n- {}", collapse_ws(&caps[1]))
    });
    let s = RE_BREAK.replace_all(&s, "\n");
    let s = RE_BLOCK_END.replace_all(&s, "\n\n");
    let s = RE_TAG.replace_all(&s, "");
    decode_entities(&s)
}

fn collapse_ws(s: &str) -> String {
    let stripped = RE_TAG.replace_all(s, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

// ── Rendering ────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Block<'a> {
    Heading(usize, &'a str),
    ListItem(&'a str),
    Table(&'a str),
    Paragraph(String),
}

fn blocks(page: &str) -> Vec<Block<'_>> {
    let mut out = Vec::new();
    for chunk in page.split("\n\n").map(str::trim).filter(|c| !c.is_empty()) {
        if chunk.starts_with('|') {
            out.push(Block::Table(chunk));
            continue;
        }
        let mut paragraph: Vec<&str> = Vec::new();
        for line in chunk.lines() {
            let heading = line
                .find(' ')
                .filter(|&n| n <= 6 && line[..n].chars().all(|c| c == '#') && n > 0);
            let item = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "));
            if heading.is_some() || item.is_some() {
                if !paragraph.is_empty() {
                    out.push(Block::Paragraph(paragraph.join(" ")));
                    paragraph.clear();
                }
            }
            match (heading, item) {
                (Some(n), _) => out.push(Block::Heading(n, line[n..].trim())),
                (None, Some(text)) => out.push(Block::ListItem(text.trim())),
                (None, None) => paragraph.push(line.trim()),
            }
        }
        if !paragraph.is_empty() {
            out.push(Block::Paragraph(paragraph.join(" ")));
        }
    }
    out
}

fn render(filename: &str, pages: &[String], options: &ConversionOptions) -> DocumentContent {
    let mut content = DocumentContent::default();
    for format in &options.to_formats {
        match format {
            OutputFormat::Md => content.md_content = Some(render_markdown(pages, options)),
            OutputFormat::Text => content.text_content = Some(render_text(pages)),
            OutputFormat::Html => content.html_content = Some(render_html(filename, pages)),
            OutputFormat::Json => content.json_content = Some(render_json(filename, pages)),
            OutputFormat::Doctags => content.doctags_content = Some(render_doctags(pages)),
        }
    }
    content
}

fn render_markdown(pages: &[String], options: &ConversionOptions) -> String {
    let separator = if options.md_page_break_placeholder.is_empty() {
        "\n\n".to_string()
    } else {
        format!("\n\n{}\n\n", options.md_page_break_placeholder)
    };
    let body = pages
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(&separator);
    format!("{body}\n")
}

static RE_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__|\*|`)").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());

fn plain(s: &str) -> String {
    let s = RE_LINK.replace_all(s, "$1");
    RE_EMPHASIS.replace_all(&s, "").to_string()
}

fn render_text(pages: &[String]) -> String {
    let mut lines = Vec::new();
    for page in pages {
        for block in blocks(page) {
            lines.push(match block {
                Block::Heading(_, t) | Block::ListItem(t) => plain(t),
                Block::Table(t) => t.to_string(),
                Block::Paragraph(t) => plain(&t),
            });
        }
    }
    let mut text = lines.join("\n\n");
    text.push('\n');
    text
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_html(filename: &str, pages: &[String]) -> String {
    let mut body = String::new();
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            body.push_str("<hr class=\"page-break\"/>\n");
        }
        let mut in_list = false;
        for block in blocks(page) {
            let is_item = matches!(block, Block::ListItem(_));
            if in_list && !is_item {
                body.push_str("</ul>\n");
            }
            if is_item && !in_list {
                body.push_str("<ul>\n");
            }
            in_list = is_item;
            match block {
                Block::Heading(level, t) => {
                    body.push_str(&format!("<h{level}>{}</h{level}>\n", escape_html(&plain(t))))
                }
                Block::ListItem(t) => {
                    body.push_str(&format!("<li>{}</li>\n", escape_html(&plain(t))))
                }
                Block::Table(t) => body.push_str(&format!("<pre>{}</pre>\n", escape_html(t))),
                Block::Paragraph(t) => {
                    body.push_str(&format!("<p>{}</p>\n", escape_html(&plain(&t))))
                }
            }
        }
        if in_list {
            body.push_str("</ul>\n");
        }
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\"/>\n<title>{}</title>\n</head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(filename)
    )
}

fn render_json(filename: &str, pages: &[String]) -> serde_json::Value {
    let pages: Vec<serde_json::Value> = pages
        .iter()
        .enumerate()
        .map(|(i, page)| {
            let items: Vec<serde_json::Value> = blocks(page)
                .into_iter()
                .map(|b| match b {
                    Block::Heading(level, t) => {
                        json!({"label": "section_header", "level": level, "text": plain(t)})
                    }
                    Block::ListItem(t) => json!({"label": "list_item", "text": plain(t)}),
                    Block::Table(t) => json!({"label": "table", "text": t}),
                    Block::Paragraph(t) => json!({"label": "text", "text": plain(&t)}),
                })
                .collect();
            json!({"page_no": i + 1, "items": items})
        })
        .collect();
    json!({"name": filename, "num_pages": pages.len(), "pages": pages})
}

fn render_doctags(pages: &[String]) -> String {
    let mut out = String::from("<doctag>");
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            out.push_str("<page_break>");
        }
        for block in blocks(page) {
            match block {
                Block::Heading(level, t) => out.push_str(&format!(
                    "<section_header_level_{level}>{}</section_header_level_{level}>",
                    plain(t)
                )),
                Block::ListItem(t) => out.push_str(&format!("<list_item>{}</list_item>", plain(t))),
                Block::Table(t) => out.push_str(&format!("<otsl>{t}</otsl>")),
                Block::Paragraph(t) => out.push_str(&format!("<text>{}</text>", plain(&t))),
            }
        }
    }
    out.push_str("</doctag>");
    out
}
