//! Plain-text extraction per document type.
//!
//! Each supported extension maps to one [`DocumentKind`]; the kind is looked up
//! once per file and turns raw bytes into text plus structural hints.

use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use crate::chunker::{ChunkMetadata, MetadataValue, StructuralHints};
use crate::error::{ProcessingError, Result};

/// Maximum decompressed bytes read from a single archive entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// A supported document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Markdown,
    PlainText,
    Docx,
    Pptx,
    Pdf,
}

/// Text and structure extracted from one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedDocument {
    pub text: String,
    pub hints: StructuralHints,
    pub metadata: ChunkMetadata,
}

impl DocumentKind {
    /// Look up the kind for a file extension (without the dot, any case).
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::PlainText),
            "docx" => Some(Self::Docx),
            "pptx" => Some(Self::Pptx),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    /// Look up the kind for a path by its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Name recorded in chunk metadata.
    pub fn name(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::PlainText => "text",
            Self::Docx => "docx",
            Self::Pptx => "pptx",
            Self::Pdf => "pdf",
        }
    }

    /// Extract text and hints from the raw file contents.
    pub fn extract(self, bytes: &[u8]) -> Result<ExtractedDocument> {
        let mut document = match self {
            Self::Markdown => extract_markdown(&String::from_utf8_lossy(bytes))?,
            Self::PlainText => ExtractedDocument {
                text: String::from_utf8_lossy(bytes).into_owned(),
                ..Default::default()
            },
            Self::Docx => extract_docx(bytes)?,
            Self::Pptx => extract_pptx(bytes)?,
            Self::Pdf => ExtractedDocument {
                text: pdf_extract::extract_text_from_mem(bytes)
                    .map_err(|e| ProcessingError::Pdf(e.to_string()))?,
                ..Default::default()
            },
        };
        document
            .metadata
            .insert("type".to_string(), self.name().into());
        Ok(document)
    }
}

/// Split YAML frontmatter off a markdown document.
///
/// The frontmatter is replaced by spaces (newlines kept) so that character
/// offsets and line numbers into the body still refer to the original file.
fn extract_markdown(text: &str) -> Result<ExtractedDocument> {
    let mut document = ExtractedDocument {
        text: text.to_string(),
        hints: StructuralHints::markdown(),
        metadata: ChunkMetadata::new(),
    };

    let Some((yaml, end)) = frontmatter_bounds(text) else {
        return Ok(document);
    };

    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| ProcessingError::Frontmatter(e.to_string()))?;
    if let serde_yaml::Value::Mapping(mapping) = value {
        for (key, value) in mapping {
            let (Some(key), Some(value)) = (key.as_str(), yaml_scalar(&value)) else {
                continue;
            };
            document.metadata.insert(key.to_string(), value);
        }
    }

    let blanked: String = text[..end]
        .chars()
        .map(|c| if c == '\n' { '\n' } else { ' ' })
        .collect();
    document.text = blanked + &text[end..];
    Ok(document)
}

/// Returns the YAML body and the byte offset just past the closing fence.
fn frontmatter_bounds(text: &str) -> Option<(&str, usize)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;
    let body_start = text.len() - rest.len();

    let mut offset = body_start;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            return Some((&text[body_start..offset], offset + line.len()));
        }
        offset += line.len();
    }
    None
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<MetadataValue> {
    match value {
        serde_yaml::Value::Bool(b) => Some(MetadataValue::Bool(*b)),
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .map(MetadataValue::Integer)
            .or_else(|| n.as_f64().map(MetadataValue::Float)),
        serde_yaml::Value::String(s) => Some(MetadataValue::Text(s.clone())),
        _ => None,
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive.by_name(name)?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ProcessingError::Xml(format!(
            "archive entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

/// One paragraph of Office XML text.
#[derive(Debug, Default)]
struct XmlParagraph {
    text: String,
    is_heading: bool,
}

/// Collect paragraphs (`<*:p>`) and their text runs (`<*:t>`).
///
/// Word marks headings with a `Heading*` or `Title` paragraph style.
fn xml_paragraphs(xml: &[u8]) -> Result<Vec<XmlParagraph>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut paragraphs = Vec::new();
    let mut current = XmlParagraph::default();
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| ProcessingError::Xml(e.to_string()))?
        {
            Event::Start(e) => match e.local_name().as_ref() {
                b"p" => current = XmlParagraph::default(),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"pStyle" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"val" {
                            let style = attr
                                .unescape_value()
                                .map_err(|e| ProcessingError::Xml(e.to_string()))?;
                            current.is_heading |= style.starts_with("Heading") || style == "Title";
                        }
                    }
                }
                b"tab" | b"br" => current.text.push(' '),
                _ => {}
            },
            Event::Text(text) if in_text => {
                let text = text
                    .unescape()
                    .map_err(|e| ProcessingError::Xml(e.to_string()))?;
                current.text.push_str(&text.replace(['\n', '\r'], " "));
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = std::mem::take(&mut current);
                    if !paragraph.text.trim().is_empty() {
                        paragraphs.push(paragraph);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs)
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedDocument> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;

    let mut document = ExtractedDocument::default();
    let mut lines = Vec::new();
    for paragraph in xml_paragraphs(&xml)? {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        if paragraph.is_heading {
            document.hints.heading_lines.insert(lines.len());
        }
        lines.push(paragraph.text);
    }
    document.text = lines.join("\n");
    Ok(document)
}

fn extract_pptx(bytes: &[u8]) -> Result<ExtractedDocument> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut document = ExtractedDocument::default();
    let mut lines = Vec::new();
    for (index, name) in slide_names.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name)?;
        if !lines.is_empty() {
            lines.push(String::new());
        }
        document.hints.heading_lines.insert(lines.len());
        lines.push(format!("Slide {}:", index + 1));
        lines.extend(xml_paragraphs(&xml)?.into_iter().map(|p| p.text));
    }
    document.text = lines.join("\n");
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_kind_lookup() {
        assert_eq!(DocumentKind::from_extension("MD"), Some(DocumentKind::Markdown));
        assert_eq!(
            DocumentKind::from_path(Path::new("a/b/deck.pptx")),
            Some(DocumentKind::Pptx)
        );
        assert_eq!(DocumentKind::from_path(Path::new("image.png")), None);
        assert_eq!(DocumentKind::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_markdown_frontmatter() {
        let text = "---\ntitle: Notes\ndraft: true\nversion: 3\ntags: [a, b]\n---\n# Body\n";
        let document = DocumentKind::Markdown.extract(text.as_bytes()).unwrap();

        assert_eq!(document.metadata.get("title"), Some(&MetadataValue::from("Notes")));
        assert_eq!(document.metadata.get("draft"), Some(&MetadataValue::Bool(true)));
        assert_eq!(document.metadata.get("version"), Some(&MetadataValue::Integer(3)));
        assert!(!document.metadata.contains_key("tags"));
        assert_eq!(document.metadata.get("type"), Some(&MetadataValue::from("markdown")));

        assert_eq!(document.text.chars().count(), text.chars().count());
        assert!(document.text.trim_start().starts_with("# Body"));
        assert!(!document.text.contains("title"));
    }

    #[test]
    fn test_markdown_without_frontmatter() {
        let document = DocumentKind::Markdown.extract(b"# Just a heading").unwrap();
        assert_eq!(document.text, "# Just a heading");
        assert!(document.hints.detect_markdown_headings);
    }

    #[test]
    fn test_invalid_frontmatter() {
        let result = DocumentKind::Markdown.extract(b"---\ntitle: [unclosed\n---\nbody");
        assert!(matches!(result, Err(ProcessingError::Frontmatter(_))));
    }

    #[test]
    fn test_docx_paragraphs_and_headings() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Overview</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Hello </w:t></w:r><w:r><w:t>world &amp; more</w:t></w:r></w:p>
<w:p></w:p>
</w:body></w:document>"#;
        let bytes = build_zip(&[("word/document.xml", xml)]);
        let document = DocumentKind::Docx.extract(&bytes).unwrap();

        assert_eq!(document.text, "Overview\n\nHello world & more");
        assert_eq!(document.hints.heading_lines.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(document.metadata.get("type"), Some(&MetadataValue::from("docx")));
    }

    #[test]
    fn test_pptx_slides_in_numeric_order() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><a:p><a:r><a:t>{text}</a:t></a:r></a:p></p:sld>"#
            )
        };
        let (first, second) = (slide("first slide"), slide("tenth slide"));
        let bytes = build_zip(&[
            ("ppt/slides/slide10.xml", second.as_str()),
            ("ppt/slides/slide1.xml", first.as_str()),
        ]);
        let document = DocumentKind::Pptx.extract(&bytes).unwrap();

        assert_eq!(
            document.text,
            "Slide 1:\nfirst slide\n\nSlide 2:\ntenth slide"
        );
        assert_eq!(
            document.hints.heading_lines.iter().copied().collect::<Vec<_>>(),
            vec![0, 3]
        );
    }

    #[test]
    fn test_corrupt_archive() {
        let result = DocumentKind::Docx.extract(b"not a zip file");
        assert!(matches!(result, Err(ProcessingError::Archive(_))));
    }
}
