//! Pluggable text extraction.
//!
//! Extractors register with a priority; the registry hands each file to the
//! highest-priority extractor that claims its MIME type. Extraction failures
//! are logged and swallowed so a single bad file never stalls the pipeline.

mod office;
mod pdf;
mod plain;

pub use office::OfficeExtractor;
pub use pdf::PdfExtractor;
pub use plain::PlainTextExtractor;

use std::path::Path;

use tracing::warn;

use crate::error::Result;

/// Output of a successful extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub text: String,
    /// Short tag naming the mechanism, e.g. `"plain"`, `"pdf"`, `"docx"`.
    pub method: String,
    /// Detected language code; empty when unknown.
    pub language: String,
    /// Confidence in the extracted text, in `[0, 1]`.
    pub confidence: f32,
}

pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher priority wins when several extractors claim a MIME type.
    fn priority(&self) -> i32;

    fn can_handle(&self, mime: &str) -> bool;

    /// Extract text from `path`. `Ok(None)` means the file is legitimately
    /// not extractable (e.g. an encrypted PDF).
    fn extract(&self, path: &Path) -> Result<Option<ExtractionResult>>;
}

/// Priority-ordered extractor registry.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Registry with the built-in extractors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PlainTextExtractor::default()));
        registry.register(Box::new(PdfExtractor::default()));
        registry.register(Box::new(OfficeExtractor));
        registry
    }

    pub fn register(&mut self, extractor: Box<dyn TextExtractor>) {
        self.extractors.push(extractor);
        self.extractors.sort_by_key(|e| std::cmp::Reverse(e.priority()));
    }

    /// Whether any registered extractor claims `mime`.
    pub fn handles(&self, mime: &str) -> bool {
        self.extractors.iter().any(|e| e.can_handle(mime))
    }

    /// Run the best matching extractor. Errors are demoted to `None`.
    pub fn extract(&self, path: &Path, mime: &str) -> Option<ExtractionResult> {
        let extractor = self.extractors.iter().find(|e| e.can_handle(mime))?;
        match extractor.extract(path) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    extractor = extractor.name(),
                    path = %path.display(),
                    error = %e,
                    "text extraction failed"
                );
                None
            }
        }
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, i32);

    impl TextExtractor for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        fn can_handle(&self, mime: &str) -> bool {
            mime == "text/plain"
        }
        fn extract(&self, _path: &Path) -> Result<Option<ExtractionResult>> {
            Ok(Some(ExtractionResult {
                text: self.0.to_string(),
                method: self.0.to_string(),
                language: String::new(),
                confidence: 1.0,
            }))
        }
    }

    #[test]
    fn highest_priority_wins() {
        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(Fixed("low", 1)));
        registry.register(Box::new(Fixed("high", 10)));
        let got = registry
            .extract(Path::new("/nowhere.txt"), "text/plain")
            .unwrap();
        assert_eq!(got.method, "high");
    }

    #[test]
    fn unclaimed_mime_yields_none() {
        let registry = ExtractorRegistry::with_defaults();
        assert!(registry
            .extract(Path::new("/nowhere.bin"), "application/x-unknown")
            .is_none());
        assert!(!registry.handles("application/x-unknown"));
        assert!(registry.handles("text/plain"));
        assert!(registry.handles("application/pdf"));
    }
}
