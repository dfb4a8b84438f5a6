//! Text extraction from uploaded document bytes.
//!
//! Plain-text formats (`txt`, `md`, `csv`, `json`) must be valid UTF-8.
//! PDF goes through `pdf-extract`; DOCX is a ZIP whose `word/document.xml`
//! is scanned for `<w:t>` runs, with a newline after each `</w:p>`.
//! Failures are [`DocChatError::Validation`]: the bytes are bad and a retry
//! of the same bytes would fail again.

use std::io::Read;

use docchat_core::models::DocumentFormat;
use docchat_core::{DocChatError, Result};
use quick_xml::events::Event;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String> {
    match format {
        DocumentFormat::Text | DocumentFormat::Markdown | DocumentFormat::Csv | DocumentFormat::Json => {
            std::str::from_utf8(bytes)
                .map(|s| s.trim_start_matches('\u{feff}').to_string())
                .map_err(|e| DocChatError::Validation(format!("{} is not valid UTF-8: {}", format, e)))
        }
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| DocChatError::Validation(format!("PDF extraction failed: {}", e)))
}

fn ooxml_err(e: impl std::fmt::Display) -> DocChatError {
    DocChatError::Validation(format!("DOCX extraction failed: {}", e))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(|e| ooxml_err(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out).map_err(ooxml_err)?;
    if out.len() as u64 >= max_bytes {
        return Err(ooxml_err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    docx_paragraphs(&xml)
}

fn docx_paragraphs(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_plain_text_passthrough() {
        let text = extract_text("héllo\nworld".as_bytes(), DocumentFormat::Markdown).unwrap();
        assert_eq!(text, "héllo\nworld");
        let bom = extract_text("\u{feff}a,b".as_bytes(), DocumentFormat::Csv).unwrap();
        assert_eq!(bom, "a,b");
    }

    #[test]
    fn test_invalid_utf8_is_validation_error() {
        let err = extract_text(&[0xff, 0xfe, 0x00], DocumentFormat::Text).unwrap_err();
        assert!(matches!(err, DocChatError::Validation(_)));
    }

    #[test]
    fn test_docx_paragraphs() {
        let bytes = docx_with_paragraphs(&["Refund policy", "Returns within 30 days &amp; more"]);
        let text = extract_text(&bytes, DocumentFormat::Docx).unwrap();
        assert_eq!(text, "Refund policy\nReturns within 30 days & more");
    }

    #[test]
    fn test_invalid_binaries() {
        assert!(matches!(
            extract_text(b"not a pdf", DocumentFormat::Pdf),
            Err(DocChatError::Validation(_))
        ));
        assert!(matches!(
            extract_text(b"not a zip", DocumentFormat::Docx),
            Err(DocChatError::Validation(_))
        ));
    }
}
