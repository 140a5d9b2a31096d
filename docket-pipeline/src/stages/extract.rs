//! Text extraction from staged files

use async_trait::async_trait;
use docket_common::messages::{AnalysisItem, IntakeItem};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;

use super::ItemOutcome;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, item: &IntakeItem) -> ItemOutcome<AnalysisItem>;
}

/// Reads staged files from local disk. PDF via `lopdf`, DOCX from the
/// `word/document.xml` part; `.txt` and `.md` as UTF-8.
#[derive(Debug, Clone, Default)]
pub struct FileTextExtractor;

impl FileTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextExtractor for FileTextExtractor {
    async fn extract(&self, item: &IntakeItem) -> ItemOutcome<AnalysisItem> {
        let path = Path::new(&item.path);
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ItemOutcome::item_error(&item.item_id, format!("cannot read {}: {}", item.display_name, e))
            }
        };

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let parse: fn(&[u8]) -> Result<String, String> = match extension.as_deref() {
            Some("pdf") => pdf_text,
            Some("docx") => docx_text,
            Some("txt") | Some("md") => plain_text,
            other => {
                return ItemOutcome::item_error(
                    &item.item_id,
                    format!("unsupported file type: {}", other.unwrap_or("none")),
                )
            }
        };

        // Parsers are CPU-bound
        let text = match tokio::task::spawn_blocking(move || parse(&bytes)).await {
            Ok(Ok(text)) => text,
            Ok(Err(reason)) => return ItemOutcome::item_error(&item.item_id, reason),
            Err(e) => return ItemOutcome::Fatal(format!("extraction task failed: {}", e)),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return ItemOutcome::item_error(&item.item_id, "no extractable text");
        }

        debug!(item_id = %item.item_id, chars = text.len(), "Text extracted");
        ItemOutcome::Ok(AnalysisItem {
            item_id: item.item_id.clone(),
            display_name: item.display_name.clone(),
            extracted_text: text,
        })
    }
}

fn plain_text(bytes: &[u8]) -> Result<String, String> {
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Concatenated page text of a PDF, pages in order
fn pdf_text(bytes: &[u8]) -> Result<String, String> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| format!("failed to parse PDF: {}", e))?;

    let mut pages: Vec<u32> = doc.get_pages().keys().cloned().collect();
    pages.sort();

    let mut text = String::new();
    for page in pages {
        let page_text = doc.extract_text(&[page]).unwrap_or_default();
        text.push_str(&page_text);
        if !page_text.ends_with('\n') && !page_text.is_empty() {
            text.push('\n');
        }
    }
    Ok(text)
}

/// Paragraph text of a DOCX body, blank paragraphs dropped.
///
/// Headings are set off as `## Title ##` so the scorer can see section
/// structure.
fn docx_text(bytes: &[u8]) -> Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("failed to open DOCX: {}", e))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| format!("DOCX has no document body: {}", e))?
        .read_to_string(&mut xml)
        .map_err(|e| format!("failed to read DOCX body: {}", e))?;

    let mut reader = Reader::from_str(&xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut heading = false;
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:pStyle" => heading = is_heading_style(&e),
                b"w:tab" => current.push('\t'),
                b"w:br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| format!("malformed DOCX text: {}", e))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    let text = current.trim();
                    if !text.is_empty() {
                        paragraphs.push(if heading {
                            format!("\n## {} ##\n", text)
                        } else {
                            text.to_string()
                        });
                    }
                    current.clear();
                    heading = false;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed DOCX body: {}", e)),
            _ => {}
        }
    }

    Ok(paragraphs.join("\n"))
}

fn is_heading_style(element: &BytesStart<'_>) -> bool {
    element.attributes().flatten().any(|attr| {
        attr.key.as_ref() == b"w:val"
            && String::from_utf8_lossy(&attr.value)
                .to_ascii_lowercase()
                .contains("heading")
    })
}
