//! Result container returned for every processed file.

use crate::error::OcrError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// The outcome of processing one file: extracted content plus descriptive
/// metadata. Created once per file and not modified afterwards.
///
/// `metadata` always carries four keys: `processor` (the processor's name),
/// `model` (the model name), `file_path` (the input as given) and
/// `file_type` (lowercased extension including the dot, e.g. `".pdf"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Extracted text: markdown-flavoured prose with HTML tables, LaTeX
    /// equations, and `<watermark>`/`<page_number>` tags as the model emits
    /// them.
    pub content: String,

    /// Descriptive key/value pairs about this run. BTreeMap keeps JSON
    /// output in a stable key order.
    pub metadata: BTreeMap<String, String>,
}

impl ConversionResult {
    /// Build a result from extracted content and its metadata map.
    pub fn new(content: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }

    /// The extracted content as markdown.
    pub fn extract_markdown(&self) -> &str {
        &self.content
    }

    /// Look up a single metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Write the content to `path` atomically (temp file + rename), so an
    /// interrupted write never leaves a half-written output behind.
    pub fn save_to_file(&self, path: &Path) -> Result<(), OcrError> {
        let tmp_path = path.with_extension("md.tmp");
        std::fs::write(&tmp_path, &self.content).map_err(|source| {
            OcrError::OutputWriteFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::rename(&tmp_path, path).map_err(|source| OcrError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }
}
