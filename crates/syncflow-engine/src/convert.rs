//! File-to-text conversion
//!
//! Source records that describe files (attachments, documents, code) carry
//! either the file content inline or a local path. [`FileToTextNode`] detects
//! the format from the MIME type, falling back to the file extension, and
//! replaces the raw content with embeddable text.
//!
//! Text formats are converted locally. Binary office, PDF and image formats
//! need an extraction backend and are rejected as `Validation` errors, which
//! skips the record.

use scraper::{Html, Node};
use std::path::Path;

use syncflow_common::types::Record;

use crate::error::{SyncError, SyncResult};
use crate::graph::{NodeSpec, TransformNode};

/// Formats a file record can be in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFormat {
    Text,
    Markdown,
    Html,
    Json,
    /// Source code, with the fence language
    Code(String),
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Image,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "scala", "c", "h", "cpp", "hpp",
    "cs", "rb", "php", "swift", "sh", "sql", "css", "yaml", "yml", "toml", "xml",
];

impl FileFormat {
    /// Detect from MIME type first, then from the file name's extension
    pub fn detect(name: Option<&str>, mime: Option<&str>) -> Option<Self> {
        mime.and_then(Self::from_mime)
            .or_else(|| name.and_then(Self::from_file_name))
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim().to_lowercase();
        let format = match essence.as_str() {
            "text/plain" | "text/csv" | "text/tab-separated-values" => Self::Text,
            "text/markdown" | "text/x-markdown" => Self::Markdown,
            "text/html" | "application/xhtml+xml" => Self::Html,
            "application/json" => Self::Json,
            "application/pdf" => Self::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Self::Docx,
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => Self::Pptx,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Self::Xlsx,
            other if other.starts_with("image/") => Self::Image,
            _ => return None,
        };
        Some(format)
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let extension = Path::new(name).extension()?.to_str()?.to_lowercase();
        let format = match extension.as_str() {
            "txt" | "log" | "csv" | "tsv" => Self::Text,
            "md" | "markdown" => Self::Markdown,
            "html" | "htm" => Self::Html,
            "json" => Self::Json,
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "pptx" => Self::Pptx,
            "xlsx" => Self::Xlsx,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tif" | "tiff" => Self::Image,
            ext if CODE_EXTENSIONS.contains(&ext) => Self::Code(ext.to_string()),
            _ => return None,
        };
        Some(format)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Json => "json",
            Self::Code(_) => "code",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Pptx => "pptx",
            Self::Xlsx => "xlsx",
            Self::Image => "image",
        }
    }

    /// Whether the format is converted without an extraction backend
    pub fn is_text(&self) -> bool {
        !matches!(self, Self::Pdf | Self::Docx | Self::Pptx | Self::Xlsx | Self::Image)
    }

    /// Convert raw file content to embeddable text
    pub fn to_text(&self, content: &str) -> SyncResult<String> {
        match self {
            Self::Text | Self::Markdown => Ok(content.trim().to_string()),
            Self::Html => Ok(html_to_text(content)),
            Self::Json => {
                let value: serde_json::Value = serde_json::from_str(content)
                    .map_err(|e| SyncError::Validation(format!("invalid JSON file: {e}")))?;
                serde_json::to_string_pretty(&value).map_err(|e| SyncError::Internal(e.to_string()))
            },
            Self::Code(language) => Ok(format!("```{language}\n{}\n```", content.trim_end())),
            binary => Err(SyncError::Validation(format!(
                "{} files are not supported for text conversion",
                binary.name()
            ))),
        }
    }
}

/// Visible text of an HTML document, one line per text node
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();

    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor.value().as_element().is_some_and(|element| {
                matches!(element.name(), "script" | "style" | "noscript" | "template")
            })
        });
        if hidden {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Replaces a file record's raw content with converted text
///
/// Params: `content_field` (default `content`), `path_field` (default `path`),
/// `name_field` (default `name`), `mime_field` (default `mime_type`),
/// `output_field` (default `text`), `max_bytes` (default 10 MiB). Inline
/// content wins over the path. The record keeps its key and type.
#[derive(Debug, Clone)]
pub struct FileToTextNode {
    pub content_field: String,
    pub path_field: String,
    pub name_field: String,
    pub mime_field: String,
    pub output_field: String,
    pub max_bytes: u64,
}

impl FileToTextNode {
    pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

    pub fn from_spec(spec: &NodeSpec) -> SyncResult<Self> {
        let field = |name: &str, default: &str| {
            spec.params
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        let max_bytes = match spec.params.get("max_bytes") {
            None => Self::DEFAULT_MAX_BYTES,
            Some(v) => v.as_u64().filter(|n| *n > 0).ok_or_else(|| {
                SyncError::Configuration("file_to_text max_bytes must be a positive integer".into())
            })?,
        };

        Ok(Self {
            content_field: field("content_field", "content"),
            path_field: field("path_field", "path"),
            name_field: field("name_field", "name"),
            mime_field: field("mime_field", "mime_type"),
            output_field: field("output_field", "text"),
            max_bytes,
        })
    }

    fn payload_str<'a>(&self, record: &'a Record, field: &str) -> Option<&'a str> {
        record.payload.get(field).and_then(|v| v.as_str())
    }

    fn read_file(&self, record: &Record, path: &str) -> SyncResult<String> {
        let size = std::fs::metadata(path)
            .map_err(|e| {
                SyncError::Validation(format!("record {}: cannot stat {path}: {e}", record.key))
            })?
            .len();
        if size > self.max_bytes {
            return Err(SyncError::Validation(format!(
                "record {}: {path} is {size} bytes, limit is {}",
                record.key, self.max_bytes
            )));
        }
        std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => {
                SyncError::Validation(format!("record {}: {path} is not UTF-8 text", record.key))
            },
            _ => SyncError::Transient(format!("record {}: cannot read {path}: {e}", record.key)),
        })
    }
}

impl TransformNode for FileToTextNode {
    fn apply(&self, mut record: Record) -> SyncResult<Vec<Record>> {
        let path = self.payload_str(&record, &self.path_field);
        let name = self.payload_str(&record, &self.name_field).or(path);
        let mime = self.payload_str(&record, &self.mime_field);

        let format = FileFormat::detect(name, mime).ok_or_else(|| {
            SyncError::Validation(format!(
                "record {} has an unrecognized file type ({})",
                record.key,
                mime.or(name).unwrap_or("no name or MIME type")
            ))
        })?;
        if !format.is_text() {
            return Err(SyncError::Validation(format!(
                "record {}: {} files are not supported for text conversion",
                record.key,
                format.name()
            )));
        }

        let raw = match self.payload_str(&record, &self.content_field) {
            Some(content) => content.to_string(),
            None => match path {
                Some(path) => self.read_file(&record, path)?,
                None => {
                    return Err(SyncError::Validation(format!(
                        "record {} has neither '{}' nor '{}'",
                        record.key, self.content_field, self.path_field
                    )))
                },
            },
        };
        let text = format.to_text(&raw)?;

        if let Some(payload) = record.payload.as_object_mut() {
            if self.content_field != self.output_field {
                payload.remove(&self.content_field);
            }
            payload.insert(self.output_field.clone(), serde_json::Value::String(text));
        }
        Ok(vec![record])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn node() -> FileToTextNode {
        FileToTextNode::from_spec(&NodeSpec::new("file_to_text", "file", &[])).unwrap()
    }

    fn file(payload: serde_json::Value) -> Record {
        Record::new("f1", "file", payload)
    }

    #[test]
    fn test_detects_by_mime_then_extension() {
        assert_eq!(
            FileFormat::detect(Some("notes.txt"), Some("text/html; charset=utf-8")),
            Some(FileFormat::Html)
        );
        assert_eq!(FileFormat::detect(Some("main.RS"), None), Some(FileFormat::Code("rs".into())));
        assert_eq!(
            FileFormat::detect(Some("deck.pptx"), Some("application/octet-stream")),
            Some(FileFormat::Pptx)
        );
        assert_eq!(FileFormat::detect(None, Some("image/png")), Some(FileFormat::Image));
        assert_eq!(FileFormat::detect(Some("archive.bin"), None), None);
        assert_eq!(FileFormat::detect(None, None), None);
    }

    #[test]
    fn test_html_keeps_visible_text_only() {
        let html = r#"<html><head><title>Plan</title><style>p { color: red }</style></head>
            <body><h1>Roadmap</h1><script>track()</script><p>Ship   the
            sync engine</p></body></html>"#;
        assert_eq!(html_to_text(html), "Plan\nRoadmap\nShip the sync engine");
    }

    #[test]
    fn test_inline_html_replaces_content() {
        let record = file(json!({"name": "page.html", "content": "<p>Hello <b>world</b></p>"}));
        let out = node().apply(record).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.as_str(), "f1");
        assert_eq!(out[0].payload["text"], "Hello\nworld");
        assert!(out[0].payload.get("content").is_none());
        assert_eq!(out[0].payload["name"], "page.html");
    }

    #[test]
    fn test_code_and_json_formats() {
        let out = node()
            .apply(file(json!({"name": "lib.py", "content": "def f():\n    return 1\n"})))
            .unwrap();
        assert_eq!(out[0].payload["text"], "```py\ndef f():\n    return 1\n```");

        let out = node()
            .apply(file(json!({"mime_type": "application/json", "content": "{\"a\":1}"})))
            .unwrap();
        assert_eq!(out[0].payload["text"], "{\n  \"a\": 1\n}");

        let err = node()
            .apply(file(json!({"name": "broken.json", "content": "{"})))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_binary_formats_are_unsupported() {
        for name in ["report.pdf", "spec.docx", "deck.pptx", "budget.xlsx", "photo.jpg"] {
            let err = node().apply(file(json!({"name": name, "content": "..."}))).unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)), "{name}");
            assert!(err.to_string().contains("not supported"), "{name}");
        }
    }

    #[test]
    fn test_reads_content_from_path() {
        let mut tmp = tempfile::Builder::new().suffix(".md").tempfile().unwrap();
        write!(tmp, "# Notes\n\nKeep it short.\n").unwrap();
        tmp.flush().unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let out = node().apply(file(json!({ "path": path }))).unwrap();
        assert_eq!(out[0].payload["text"], "# Notes\n\nKeep it short.");

        let small = FileToTextNode::from_spec(
            &NodeSpec::new("file_to_text", "file", &[]).with_params(json!({"max_bytes": 4})),
        )
        .unwrap();
        assert!(matches!(
            small.apply(file(json!({ "path": path }))),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_content_and_bad_params() {
        let err = node().apply(file(json!({"name": "a.txt"}))).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let spec = NodeSpec::new("file_to_text", "file", &[]).with_params(json!({"max_bytes": 0}));
        assert!(matches!(
            FileToTextNode::from_spec(&spec),
            Err(SyncError::Configuration(_))
        ));
    }
}
