//! Office document extraction (OpenXML and OpenDocument).
//!
//! Both families are zip archives of XML entries; only the entries that carry
//! user-visible text are read.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use super::plain::collapse_whitespace;
use super::{ExtractionResult, TextExtractor};
use crate::error::{Error, Result};

const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const MIME_PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
const MIME_ODT: &str = "application/vnd.oasis.opendocument.text";
const MIME_ODS: &str = "application/vnd.oasis.opendocument.spreadsheet";

const MAX_SHEETS: usize = 50;
const MAX_SLIDES: usize = 200;

pub struct OfficeExtractor;

impl TextExtractor for OfficeExtractor {
    fn name(&self) -> &'static str {
        "office"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_handle(&self, mime: &str) -> bool {
        matches!(mime, MIME_DOCX | MIME_XLSX | MIME_PPTX | MIME_ODT | MIME_ODS)
    }

    fn extract(&self, path: &Path) -> Result<Option<ExtractionResult>> {
        let file = File::open(path)?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| Error::Io(format!("zip open: {e}")))?;

        // The extractor is selected by MIME, but the archive itself tells us
        // the family, so a misnamed file still extracts.
        let (text, method) = if has_entry(&mut archive, "word/document.xml") {
            (extract_docx(&mut archive)?, "docx")
        } else if has_entry(&mut archive, "xl/workbook.xml") {
            (extract_xlsx(&mut archive)?, "xlsx")
        } else if has_entry(&mut archive, "ppt/presentation.xml") {
            (extract_pptx(&mut archive)?, "pptx")
        } else if has_entry(&mut archive, "content.xml") {
            (extract_opendocument(&mut archive)?, "odf")
        } else {
            return Ok(None);
        };

        let text = collapse_whitespace(&text);
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExtractionResult {
            text,
            method: method.to_string(),
            language: String::new(),
            confidence: 1.0,
        }))
    }
}

fn has_entry(archive: &mut ZipArchive<File>, name: &str) -> bool {
    archive.by_name(name).is_ok()
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Option<Vec<u8>> {
    let mut entry = archive.by_name(name).ok()?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).ok()?;
    Some(buf)
}

/// DOCX: the main document plus headers and footers 1..3, text from `<w:t>`.
fn extract_docx(archive: &mut ZipArchive<File>) -> Result<String> {
    let mut parts = Vec::new();
    if let Some(xml) = read_entry(archive, "word/document.xml") {
        parts.push(wordprocessing_text(&xml));
    }
    for n in 1..=3 {
        for kind in ["header", "footer"] {
            if let Some(xml) = read_entry(archive, &format!("word/{kind}{n}.xml")) {
                parts.push(wordprocessing_text(&xml));
            }
        }
    }
    Ok(parts.join("\n"))
}

/// Text of `<…:t>` nodes, one line per `<…:p>` paragraph.
fn wordprocessing_text(xml: &[u8]) -> String {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = 0u32;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text += 1,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = in_text.saturating_sub(1),
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text > 0 => {
                out.push_str(&t.unescape().unwrap_or(std::borrow::Cow::Borrowed("")));
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

/// XLSX: shared strings resolved into each worksheet's cells.
fn extract_xlsx(archive: &mut ZipArchive<File>) -> Result<String> {
    let shared = read_entry(archive, "xl/sharedStrings.xml")
        .map(|xml| shared_strings(&xml))
        .unwrap_or_default();

    let mut out = String::new();
    for n in 1..=MAX_SHEETS {
        let Some(xml) = read_entry(archive, &format!("xl/worksheets/sheet{n}.xml")) else {
            break;
        };
        out.push_str(&worksheet_text(&xml, &shared));
        out.push('\n');
    }
    Ok(out)
}

fn shared_strings(xml: &[u8]) -> Vec<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" if in_item => in_text = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = false;
                    strings.push(current.clone());
                }
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                current.push_str(&t.unescape().unwrap_or(std::borrow::Cow::Borrowed("")));
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    strings
}

fn worksheet_text(xml: &[u8], shared: &[String]) -> String {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut cell_is_shared = false;
    let mut in_value = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"row" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_value => {
                let value = t.unescape().unwrap_or(std::borrow::Cow::Borrowed(""));
                if cell_is_shared {
                    if let Some(text) = value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| shared.get(idx))
                    {
                        out.push_str(text);
                        out.push(' ');
                    }
                } else {
                    out.push_str(&value);
                    out.push(' ');
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

/// PPTX: slides and their notes pages, in deck order.
fn extract_pptx(archive: &mut ZipArchive<File>) -> Result<String> {
    let mut parts = Vec::new();
    for n in 1..=MAX_SLIDES {
        let Some(xml) = read_entry(archive, &format!("ppt/slides/slide{n}.xml")) else {
            break;
        };
        parts.push(wordprocessing_text(&xml));
        if let Some(notes) = read_entry(archive, &format!("ppt/notesSlides/notesSlide{n}.xml")) {
            parts.push(wordprocessing_text(&notes));
        }
    }
    Ok(parts.join("\n\n"))
}

/// ODT/ODS: text from `:p`, `:h` and `:span` nodes of `content.xml`, with a
/// newline after each paragraph or heading.
fn extract_opendocument(archive: &mut ZipArchive<File>) -> Result<String> {
    let Some(xml) = read_entry(archive, "content.xml") else {
        return Ok(String::new());
    };
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut depth = 0u32;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if matches!(e.local_name().as_ref(), b"p" | b"h" | b"span") {
                    depth += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"p" | b"h" => {
                    depth = depth.saturating_sub(1);
                    out.push('\n');
                }
                b"span" => depth = depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Text(t)) if depth > 0 => {
                out.push_str(&t.unescape().unwrap_or(std::borrow::Cow::Borrowed("")));
            }
            Ok(Event::CData(c)) if depth > 0 => {
                out.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_archive(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("doc.bin")).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        dir
    }

    fn extract_from(entries: &[(&str, &str)]) -> Option<ExtractionResult> {
        let dir = build_archive(entries);
        OfficeExtractor
            .extract(&dir.path().join("doc.bin"))
            .unwrap()
    }

    #[test]
    fn docx_paragraphs_and_headers() {
        let got = extract_from(&[
            (
                "word/document.xml",
                r#"<w:document xmlns:w="ns"><w:body>
                    <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t> world</w:t></w:r></w:p>
                    <w:p><w:r><w:t>Second</w:t></w:r></w:p>
                </w:body></w:document>"#,
            ),
            (
                "word/header1.xml",
                r#"<w:hdr xmlns:w="ns"><w:p><w:r><w:t>Top of page</w:t></w:r></w:p></w:hdr>"#,
            ),
        ])
        .unwrap();
        assert_eq!(got.method, "docx");
        assert_eq!(got.text, "Hello world Second Top of page");
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let got = extract_from(&[
            ("xl/workbook.xml", "<workbook/>"),
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>Groceries</t></si><si><t>Rent</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData>
                    <row><c t="s"><v>0</v></c><c><v>42.5</v></c></row>
                    <row><c t="s"><v>1</v></c><c><v>900</v></c></row>
                </sheetData></worksheet>"#,
            ),
        ])
        .unwrap();
        assert_eq!(got.method, "xlsx");
        assert_eq!(got.text, "Groceries 42.5 Rent 900");
    }

    #[test]
    fn pptx_slides_with_notes() {
        let got = extract_from(&[
            ("ppt/presentation.xml", "<presentation/>"),
            (
                "ppt/slides/slide1.xml",
                r#"<p:sld xmlns:a="ns"><a:p><a:r><a:t>Quarterly review Q2</a:t></a:r></a:p></p:sld>"#,
            ),
            (
                "ppt/notesSlides/notesSlide1.xml",
                r#"<p:notes xmlns:a="ns"><a:p><a:r><a:t>remember the numbers</a:t></a:r></a:p></p:notes>"#,
            ),
            (
                "ppt/slides/slide2.xml",
                r#"<p:sld xmlns:a="ns"><a:p><a:r><a:t>Roadmap</a:t></a:r></a:p></p:sld>"#,
            ),
        ])
        .unwrap();
        assert_eq!(got.method, "pptx");
        assert_eq!(got.text, "Quarterly review Q2 remember the numbers Roadmap");
    }

    #[test]
    fn odt_paragraphs() {
        let got = extract_from(&[(
            "content.xml",
            r#"<office:document-content xmlns:text="ns">
                <text:h>Shopping list</text:h>
                <text:p>milk <text:span>and eggs</text:span></text:p>
            </office:document-content>"#,
        )])
        .unwrap();
        assert_eq!(got.method, "odf");
        assert_eq!(got.text, "Shopping list milk and eggs");
    }

    #[test]
    fn unknown_archive_yields_none() {
        assert!(extract_from(&[("random.txt", "hello")]).is_none());
    }
}
