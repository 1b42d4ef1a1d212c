//! PDF text extraction.

use std::path::Path;

use lopdf::Document;

use super::plain::collapse_whitespace;
use super::{ExtractionResult, TextExtractor};
use crate::error::Result;

const DEFAULT_MAX_PAGES: usize = 50;

/// Below this average character count per page the document is likely an
/// image scan and the result is flagged as sparse.
const SPARSE_CHARS_PER_PAGE: usize = 100;

pub struct PdfExtractor {
    max_pages: usize,
}

impl PdfExtractor {
    pub fn new(max_pages: usize) -> Self {
        Self { max_pages }
    }
}

impl Default for PdfExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAGES)
    }
}

impl TextExtractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_handle(&self, mime: &str) -> bool {
        mime == "application/pdf"
    }

    fn extract(&self, path: &Path) -> Result<Option<ExtractionResult>> {
        let doc = match Document::load(path) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "unreadable pdf");
                return Ok(None);
            }
        };
        if doc.is_encrypted() {
            return Ok(None);
        }

        let page_numbers: Vec<u32> = doc
            .get_pages()
            .keys()
            .copied()
            .take(self.max_pages)
            .collect();
        if page_numbers.is_empty() {
            return Ok(None);
        }

        let mut pages = Vec::with_capacity(page_numbers.len());
        for number in &page_numbers {
            // A single corrupt page must not sink the document.
            match doc.extract_text(&[*number]) {
                Ok(text) => pages.push(collapse_whitespace(&text)),
                Err(e) => {
                    tracing::debug!(page = number, error = %e, "pdf page extraction failed");
                    pages.push(String::new());
                }
            }
        }

        let text = pages.join("\n\n");
        let chars: usize = pages.iter().map(|p| p.chars().count()).sum();
        let average = chars / page_numbers.len();

        let (method, confidence) = if average < SPARSE_CHARS_PER_PAGE {
            ("pdf_sparse", 0.3)
        } else {
            ("pdf", 1.0)
        };

        Ok(Some(ExtractionResult {
            text,
            method: method.to_string(),
            language: String::new(),
            confidence,
        }))
    }
}
