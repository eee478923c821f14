//! Document extraction facade.
//!
//! [`DocumentExtractor`] owns an ordered list of [`DocumentProcessor`]s and
//! hands each document to the first one that claims its extension. The only
//! built-in processor is [`LocalNanonetsProcessor`]; everything runs on this
//! machine, so there is no account, token, or API key anywhere in the
//! construction path.

use std::path::Path;

use tracing::debug;

use crate::config::ProcessorConfig;
use crate::error::{OcrError, Result};
use crate::processor::{normalised_extension, LocalNanonetsProcessor};
use crate::result::ConversionResult;

/// A conversion backend that turns one file into a [`ConversionResult`].
pub trait DocumentProcessor: Send + Sync {
    /// Short identifier recorded in result metadata and logs.
    fn name(&self) -> &str;

    /// Extensions this processor accepts, lowercase with the leading dot.
    fn supported_formats(&self) -> &[&str];

    /// Whether this processor wants the file. The default matches the
    /// extension against [`supported_formats`](Self::supported_formats).
    fn can_process(&self, path: &Path) -> bool {
        match normalised_extension(path) {
            Some(ext) => self.supported_formats().contains(&ext.as_str()),
            None => false,
        }
    }

    /// Convert the file.
    fn process(&self, path: &Path) -> Result<ConversionResult>;
}

/// Routes documents to registered processors in order.
pub struct DocumentExtractor {
    processors: Vec<Box<dyn DocumentProcessor>>,
}

impl DocumentExtractor {
    /// Extractor with the local OCR processor registered under default
    /// settings.
    pub fn new() -> Self {
        Self::with_config(ProcessorConfig::default())
    }

    /// Extractor with the local OCR processor built from `config`.
    pub fn with_config(config: ProcessorConfig) -> Self {
        let mut extractor = Self {
            processors: Vec::new(),
        };
        extractor.register(Box::new(LocalNanonetsProcessor::new(config)));
        extractor
    }

    /// Append a processor. Registration order is dispatch priority: the first
    /// processor whose `can_process` accepts a file handles it.
    pub fn register(&mut self, processor: Box<dyn DocumentProcessor>) {
        debug!(processor = processor.name(), "processor registered");
        self.processors.push(processor);
    }

    /// Names of the registered processors, in dispatch order.
    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Union of all registered processors' extensions, in registration order,
    /// without duplicates.
    pub fn supported_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = Vec::new();
        for processor in &self.processors {
            for fmt in processor.supported_formats() {
                if !formats.iter().any(|known| known == fmt) {
                    formats.push((*fmt).to_string());
                }
            }
        }
        formats
    }

    /// Convert `path` with the first processor that accepts it.
    pub fn extract(&self, path: impl AsRef<Path>) -> Result<ConversionResult> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OcrError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        for processor in &self.processors {
            if processor.can_process(path) {
                debug!(
                    processor = processor.name(),
                    path = %path.display(),
                    "dispatching document"
                );
                return processor.process(path);
            }
        }
        Err(OcrError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: normalised_extension(path).unwrap_or_default(),
        })
    }
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self::new()
    }
}
