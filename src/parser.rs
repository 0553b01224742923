//! Format dispatch and text extraction for source documents.
//!
//! The [`ParserAdapter`] is a flat tagged union over the supported formats:
//! structured documents (PDF, behind the [`DocumentConverter`] trait),
//! markdown, plain text, and JSON. Every variant yields ordered pages of
//! sanitized text; non-paginated formats are a single page 1.
//!
//! Sanitization strips inline base64 image payloads, HTML comments, and img
//! tags from extracted text and collapses whitespace, so chunk content never
//! carries binary markers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use base64::Engine;
use regex::Regex;

use crate::config::ConverterConfig;
use crate::error::IngestError;

static DATA_IMAGE_MD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)!\[[^\]]*\]\(\s*data:image[^)]+\)").unwrap());
static DATA_IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img[^>]+src=["']data:image[^"']+["'][^>]*>"#).unwrap());
static DATA_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)data:image/[a-z0-9.+-]+;base64,[^\s)"'>]+"#).unwrap());
static HTML_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static EMPTY_IMAGE_MD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)!\[[^\]]*\]\(\s*\)").unwrap());
static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img[^>]*>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Remove inline base64 image payloads and tidy whitespace.
pub fn sanitize_page_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let cleaned = DATA_IMAGE_MD.replace_all(text, " ");
    let cleaned = DATA_IMAGE_TAG.replace_all(&cleaned, " ");
    let cleaned = DATA_URI.replace_all(&cleaned, " ");
    let cleaned = HTML_COMMENT.replace_all(&cleaned, " ");
    let cleaned = EMPTY_IMAGE_MD.replace_all(&cleaned, " ");
    let cleaned = IMG_TAG.replace_all(&cleaned, " ");
    let cleaned = WHITESPACE.replace_all(&cleaned, " ");
    cleaned.trim().to_string()
}

/// Options forwarded to a structured document converter.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub do_ocr: bool,
    pub extract_tables: bool,
    pub generate_page_images: bool,
    pub image_scale: f64,
    pub accelerator: String,
    pub num_threads: usize,
}

impl From<&ConverterConfig> for ConvertOptions {
    fn from(config: &ConverterConfig) -> Self {
        Self {
            do_ocr: config.do_ocr,
            extract_tables: config.extract_tables,
            generate_page_images: config.generate_page_images,
            image_scale: config.image_scale,
            accelerator: config.accelerator.clone(),
            num_threads: config.num_threads,
        }
    }
}

/// A page render produced by a converter, not yet written to the cache.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub bytes: Vec<u8>,
    pub extension: String,
}

/// Raw per-page output of a parse, before cache materialization.
#[derive(Debug, Clone)]
pub struct ConvertedPage {
    pub number: i64,
    pub text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub image: Option<PageImage>,
}

/// Raw parse output: ordered pages plus document-level metadata.
#[derive(Debug, Clone)]
pub struct ConvertedDocument {
    pub title: Option<String>,
    pub pages: Vec<ConvertedPage>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// External structured-document converter contract. Implementations turn a
/// file on disk into ordered pages; options carry the OCR, table-extraction,
/// accelerator, and page-image toggles the backend understands.
pub trait DocumentConverter: Send + Sync {
    fn name(&self) -> &str;
    fn convert(&self, path: &Path, options: &ConvertOptions)
        -> Result<ConvertedDocument, IngestError>;
}

/// Text-only PDF converter over `pdf_extract`. Pages are split on form feeds
/// when the extractor emits them; otherwise the whole document is page 1.
/// Produces no page renders regardless of `generate_page_images`.
pub struct PdfTextConverter;

impl DocumentConverter for PdfTextConverter {
    fn name(&self) -> &str {
        "pdf-text"
    }

    fn convert(
        &self,
        path: &Path,
        _options: &ConvertOptions,
    ) -> Result<ConvertedDocument, IngestError> {
        let bytes = std::fs::read(path)
            .map_err(|e| IngestError::Parse(format!("cannot read {}: {}", path.display(), e)))?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| IngestError::Parse(format!("pdf extraction failed: {}", e)))?;

        let page_texts: Vec<&str> = if text.contains('\u{c}') {
            text.split('\u{c}').collect()
        } else {
            vec![text.as_str()]
        };

        let pages = page_texts
            .iter()
            .enumerate()
            .map(|(i, page_text)| ConvertedPage {
                number: (i + 1) as i64,
                text: page_text.to_string(),
                metadata: serde_json::Map::new(),
                image: None,
            })
            .collect();

        Ok(ConvertedDocument {
            title: None,
            pages,
            metadata: serde_json::Map::new(),
        })
    }
}

/// Polymorphic parser over the supported formats. Cheap to clone; the
/// structured variant shares its converter.
#[derive(Clone)]
pub enum ParserAdapter {
    Structured(Arc<dyn DocumentConverter>),
    PlainText,
    Markdown,
    Json,
}

impl std::fmt::Debug for ParserAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParserAdapter::Structured(_) => f.write_str("Structured"),
            ParserAdapter::PlainText => f.write_str("PlainText"),
            ParserAdapter::Markdown => f.write_str("Markdown"),
            ParserAdapter::Json => f.write_str("Json"),
        }
    }
}

impl ParserAdapter {
    /// Pick the adapter for a path by extension.
    pub fn for_path(
        path: &Path,
        converter: &Arc<dyn DocumentConverter>,
    ) -> Result<Self, IngestError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(ParserAdapter::Structured(Arc::clone(converter))),
            "md" | "markdown" => Ok(ParserAdapter::Markdown),
            "txt" | "text" => Ok(ParserAdapter::PlainText),
            "json" => Ok(ParserAdapter::Json),
            _ => Err(IngestError::UnsupportedFormat(format!(
                "no parser for '{}'",
                path.display()
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParserAdapter::Structured(_) => "structured",
            ParserAdapter::PlainText => "plain-text",
            ParserAdapter::Markdown => "markdown",
            ParserAdapter::Json => "json",
        }
    }

    /// Parse a file into raw pages. Text is sanitized here so the cached form
    /// is exactly what the chunker sees. Blocking; callers on the async path
    /// wrap this in `spawn_blocking`.
    pub fn parse(
        &self,
        path: &Path,
        options: &ConvertOptions,
    ) -> Result<ConvertedDocument, IngestError> {
        let mut converted = match self {
            ParserAdapter::Structured(converter) => converter.convert(path, options)?,
            ParserAdapter::PlainText => parse_plain_text(path)?,
            ParserAdapter::Markdown => parse_markdown(path, options)?,
            ParserAdapter::Json => parse_json(path)?,
        };

        for page in &mut converted.pages {
            page.text = sanitize_page_text(&page.text);
            if !options.generate_page_images {
                page.image = None;
            }
        }
        if converted.title.is_none() {
            converted.title = Some(file_stem(path));
        }
        Ok(converted)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_lossy(path: &Path) -> Result<String, IngestError> {
    let bytes = std::fs::read(path)
        .map_err(|e| IngestError::Parse(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn single_page(text: String) -> Vec<ConvertedPage> {
    vec![ConvertedPage {
        number: 1,
        text,
        metadata: serde_json::Map::new(),
        image: None,
    }]
}

fn parse_plain_text(path: &Path) -> Result<ConvertedDocument, IngestError> {
    let text = read_lossy(path)?;
    Ok(ConvertedDocument {
        title: None,
        pages: single_page(text),
        metadata: serde_json::Map::new(),
    })
}

/// Flatten markdown to text via pulldown-cmark events, keeping headings and
/// code content. The first embedded data-URI image becomes the page render,
/// mirroring how structured converters materialise page previews.
fn parse_markdown(path: &Path, options: &ConvertOptions) -> Result<ConvertedDocument, IngestError> {
    let raw = read_lossy(path)?;

    let mut image = None;
    if options.generate_page_images {
        image = extract_data_uri_image(&raw);
    }

    let mut text = String::new();
    let mut title: Option<String> = None;
    let mut in_heading = false;
    let parser = pulldown_cmark::Parser::new_ext(&raw, pulldown_cmark::Options::all());
    for event in parser {
        use pulldown_cmark::{Event, Tag, TagEnd};
        match event {
            Event::Start(Tag::Heading { .. }) => {
                in_heading = true;
                text.push('\n');
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                text.push('\n');
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::BlockQuote(_)) => text.push('\n'),
            Event::Text(t) => {
                if in_heading && title.is_none() && !t.trim().is_empty() {
                    title = Some(t.trim().to_string());
                }
                text.push_str(&t);
                text.push(' ');
            }
            Event::Code(t) => {
                text.push_str(&t);
                text.push(' ');
            }
            Event::SoftBreak | Event::HardBreak => text.push(' '),
            _ => {}
        }
    }

    let mut metadata = serde_json::Map::new();
    if let Some(t) = &title {
        metadata.insert("heading".to_string(), serde_json::Value::String(t.clone()));
    }

    let mut pages = single_page(text);
    pages[0].image = image;
    Ok(ConvertedDocument {
        title,
        pages,
        metadata,
    })
}

/// Decode the first inline `data:image/...;base64,` payload found in the text.
fn extract_data_uri_image(text: &str) -> Option<PageImage> {
    let m = DATA_URI.find(text)?;
    let uri = m.as_str();
    let (header, payload) = uri.split_once(',')?;
    let extension = header
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split(';').next())
        .map(|subtype| match subtype {
            "jpeg" | "jpg" => "jpg".to_string(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "png".to_string());
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()?;
    Some(PageImage { bytes, extension })
}

/// JSON sources are normalized to pretty-printed text on page 1, so nested
/// values remain searchable without a format-specific chunker.
fn parse_json(path: &Path) -> Result<ConvertedDocument, IngestError> {
    let raw = read_lossy(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| IngestError::Parse(format!("invalid json in {}: {}", path.display(), e)))?;
    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| IngestError::Parse(format!("json render failed: {}", e)))?;
    Ok(ConvertedDocument {
        title: None,
        pages: single_page(text),
        metadata: serde_json::Map::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConvertOptions {
        ConvertOptions {
            do_ocr: false,
            extract_tables: true,
            generate_page_images: true,
            image_scale: 2.0,
            accelerator: "auto".to_string(),
            num_threads: 0,
        }
    }

    fn test_converter() -> Arc<dyn DocumentConverter> {
        Arc::new(PdfTextConverter)
    }

    #[test]
    fn test_sanitize_strips_data_images() {
        let text = "before ![chart](data:image/png;base64,AAAA) after";
        assert_eq!(sanitize_page_text(text), "before after");
    }

    #[test]
    fn test_sanitize_strips_img_tags_and_comments() {
        let text = "a <img src=\"x.png\"> b <!-- hidden\nnote --> c";
        assert_eq!(sanitize_page_text(text), "a b c");
    }

    #[test]
    fn test_sanitize_collapses_whitespace() {
        assert_eq!(sanitize_page_text("  a\n\n b\t\tc  "), "a b c");
        assert_eq!(sanitize_page_text(""), "");
    }

    #[test]
    fn test_dispatch_by_extension() {
        let conv = test_converter();
        assert_eq!(
            ParserAdapter::for_path(Path::new("a.PDF"), &conv)
                .unwrap()
                .name(),
            "structured"
        );
        assert_eq!(
            ParserAdapter::for_path(Path::new("a.md"), &conv)
                .unwrap()
                .name(),
            "markdown"
        );
        assert_eq!(
            ParserAdapter::for_path(Path::new("a.txt"), &conv)
                .unwrap()
                .name(),
            "plain-text"
        );
        assert_eq!(
            ParserAdapter::for_path(Path::new("a.json"), &conv)
                .unwrap()
                .name(),
            "json"
        );
        let err = ParserAdapter::for_path(Path::new("a.exe"), &conv).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_plain_text_single_page() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "alpha beta\ngamma").unwrap();

        let conv = test_converter();
        let adapter = ParserAdapter::for_path(&path, &conv).unwrap();
        let doc = adapter.parse(&path, &options()).unwrap();
        assert_eq!(doc.pages.len(), 1);
        assert_eq!(doc.pages[0].number, 1);
        assert_eq!(doc.pages[0].text, "alpha beta gamma");
        assert_eq!(doc.title.as_deref(), Some("notes"));
    }

    #[test]
    fn test_markdown_flattened_with_title() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("guide.md");
        std::fs::write(&path, "# Deploy Guide\n\nRun `make deploy` twice.\n").unwrap();

        let conv = test_converter();
        let adapter = ParserAdapter::for_path(&path, &conv).unwrap();
        let doc = adapter.parse(&path, &options()).unwrap();
        assert_eq!(doc.title.as_deref(), Some("Deploy Guide"));
        assert_eq!(doc.pages.len(), 1);
        assert!(doc.pages[0].text.contains("Deploy Guide"));
        assert!(doc.pages[0].text.contains("make deploy"));
    }

    #[test]
    fn test_markdown_data_uri_becomes_render() {
        // 1x1 transparent PNG
        let png = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("fig.md");
        std::fs::write(
            &path,
            format!("# Figure\n\n![f](data:image/png;base64,{})\n\ncaption text\n", png),
        )
        .unwrap();

        let conv = test_converter();
        let adapter = ParserAdapter::for_path(&path, &conv).unwrap();
        let doc = adapter.parse(&path, &options()).unwrap();
        let image = doc.pages[0].image.as_ref().expect("render captured");
        assert_eq!(image.extension, "png");
        assert!(!image.bytes.is_empty());
        // Payload itself must not leak into the text
        assert!(!doc.pages[0].text.contains("base64"));
        assert!(doc.pages[0].text.contains("caption text"));
    }

    #[test]
    fn test_json_pretty_printed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, r#"{"service":"billing","replicas":3}"#).unwrap();

        let conv = test_converter();
        let adapter = ParserAdapter::for_path(&path, &conv).unwrap();
        let doc = adapter.parse(&path, &options()).unwrap();
        assert_eq!(doc.pages.len(), 1);
        assert!(doc.pages[0].text.contains("billing"));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ nope").unwrap();

        let conv = test_converter();
        let adapter = ParserAdapter::for_path(&path, &conv).unwrap();
        let err = adapter.parse(&path, &options()).unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }

    #[test]
    fn test_corrupt_pdf_is_parse_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.pdf");
        std::fs::write(&path, b"not a valid pdf").unwrap();

        let conv = test_converter();
        let adapter = ParserAdapter::for_path(&path, &conv).unwrap();
        let err = adapter.parse(&path, &options()).unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }
}
