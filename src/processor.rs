//! The local OCR processor: format dispatch, PDF rasterisation, page
//! assembly.
//!
//! [`LocalNanonetsProcessor`] is the single entry point for turning a file
//! into markdown. Images go straight to the model; PDFs are rasterised at
//! [`ProcessorConfig::render_scale`], each page written to its own temporary
//! PNG, transcribed in order, and stitched together under `## Page N`
//! headings.
//!
//! Three guarantees the tests lean on:
//! - The engine loads lazily on the first document and is reused afterwards.
//!   A failed load leaves the slot empty, so the next call retries instead of
//!   wedging the processor.
//! - Every temporary page file is removed, whether its page succeeds or
//!   fails.
//! - A page failure aborts the remaining pages; partial transcripts are never
//!   returned.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, error, info};

use crate::config::ProcessorConfig;
use crate::engine::OcrEngine;
use crate::error::{OcrError, Result};
use crate::extractor::DocumentProcessor;
use crate::model::NanonetsEngine;
use crate::pipeline::{postprocess, render};
use crate::progress::ProgressCallback;
use crate::prompts::OCR_PROMPT;
use crate::result::ConversionResult;

/// Name recorded under the `processor` metadata key.
pub const PROCESSOR_NAME: &str = "LocalNanonetsProcessor";

/// Extensions the processor accepts, lowercase with the leading dot.
pub const SUPPORTED_FORMATS: &[&str] =
    &[".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".webp", ".pdf"];

/// Factory that produces a ready inference engine from the configuration.
pub type EngineLoader = Box<dyn Fn(&ProcessorConfig) -> Result<Box<dyn OcrEngine>> + Send + Sync>;

/// Lowercased file extension with its leading dot, e.g. `".png"`.
pub(crate) fn normalised_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

/// OCR processor that runs the Nanonets model on this machine.
pub struct LocalNanonetsProcessor {
    config: ProcessorConfig,
    engine: Mutex<Option<Box<dyn OcrEngine>>>,
    loader: EngineLoader,
}

impl LocalNanonetsProcessor {
    /// Processor backed by [`NanonetsEngine`]. No weights are touched until
    /// the first document arrives.
    pub fn new(config: ProcessorConfig) -> Self {
        Self::with_engine_loader(
            config,
            Box::new(|cfg| Ok(Box::new(NanonetsEngine::load(cfg)?) as Box<dyn OcrEngine>)),
        )
    }

    /// Processor with a custom engine factory.
    ///
    /// The tests drive the dispatch, cleanup and retry paths with scripted
    /// engines through this constructor; it also lets an embedder put a
    /// different backend behind the same PDF handling.
    pub fn with_engine_loader(config: ProcessorConfig, loader: EngineLoader) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
            loader,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Formats accepted by [`process`](Self::process).
    pub fn supported_formats() -> &'static [&'static str] {
        SUPPORTED_FORMATS
    }

    /// Cheap extension check; does not open the file.
    pub fn can_process(&self, path: impl AsRef<Path>) -> bool {
        normalised_extension(path.as_ref())
            .map(|ext| SUPPORTED_FORMATS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Whether the model is currently resident. Loading happens on demand
    /// inside [`process`](Self::process).
    pub fn is_loaded(&self) -> bool {
        self.engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Convert one document to markdown.
    pub fn process(&self, path: impl AsRef<Path>) -> Result<ConversionResult> {
        let path = path.as_ref();
        self.process_inner(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "document processing failed");
            e
        })
    }

    fn process_inner(&self, path: &Path) -> Result<ConversionResult> {
        if !path.exists() {
            return Err(OcrError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let extension = match normalised_extension(path) {
            Some(ext) if SUPPORTED_FORMATS.contains(&ext.as_str()) => ext,
            other => {
                return Err(OcrError::UnsupportedFormat {
                    path: path.to_path_buf(),
                    extension: other.unwrap_or_default(),
                })
            }
        };
        info!(path = %path.display(), file_type = %extension, "processing document");

        let content = if extension == ".pdf" {
            self.process_pdf(path)?
        } else {
            self.process_image(path)?
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("processor".to_string(), PROCESSOR_NAME.to_string());
        metadata.insert("model".to_string(), self.config.model_name().to_string());
        metadata.insert("file_path".to_string(), path.display().to_string());
        metadata.insert("file_type".to_string(), extension);
        Ok(ConversionResult::new(content, metadata))
    }

    /// Single image: one model call, no page heading.
    fn process_image(&self, path: &Path) -> Result<String> {
        if let Some(cb) = self.progress() {
            cb.on_page_start(1, 1);
        }
        let text = self.run_ocr(path)?;
        if let Some(cb) = self.progress() {
            cb.on_page_complete(1, 1, text.len());
            cb.on_document_complete(1);
        }
        Ok(text)
    }

    /// Rasterise every page up front, then transcribe them in order. Each
    /// page lives in its own temporary PNG for exactly the duration of its
    /// model call.
    fn process_pdf(&self, path: &Path) -> Result<String> {
        let pages = render::render_pages(path, self.config.render_scale)?;
        let total = pages.len();
        let mut sections = Vec::with_capacity(total);
        for (idx, page) in pages.into_iter().enumerate() {
            let page_num = idx + 1;
            if let Some(cb) = self.progress() {
                cb.on_page_start(page_num, total);
            }
            let temp = tempfile::Builder::new()
                .prefix(&format!("docstrange-page-{page_num}-"))
                .suffix(".png")
                .tempfile()
                .map_err(|source| OcrError::TempFileFailed { source })?;
            page.save_with_format(temp.path(), image::ImageFormat::Png)
                .map_err(|e| OcrError::PageRenderFailed {
                    page: page_num,
                    detail: format!("writing temporary PNG: {e}"),
                })?;
            debug!(page = page_num, temp = %temp.path().display(), "page rasterised");

            // Dropping `temp` removes the file, on the error paths above and
            // below as well as at the end of the iteration.
            let text = self.run_ocr(temp.path())?;
            if let Some(cb) = self.progress() {
                cb.on_page_complete(page_num, total, text.len());
            }
            sections.push(format!("## Page {page_num}\n\n{text}"));
        }
        if let Some(cb) = self.progress() {
            cb.on_document_complete(total);
        }
        Ok(sections.join("\n\n"))
    }

    /// Run the model over one image file, loading the engine first if needed.
    fn run_ocr(&self, image_path: &Path) -> Result<String> {
        // A poisoned lock means an earlier call panicked; the slot is still
        // either empty or a loaded engine, so carry on with its contents.
        let mut slot = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        let engine = match slot.as_mut() {
            Some(engine) => engine,
            None => {
                if let Some(cb) = self.progress() {
                    cb.on_load_start(&self.config.model_id);
                }
                let engine = (self.loader)(&self.config)?;
                if let Some(cb) = self.progress() {
                    cb.on_load_complete(&self.config.model_id);
                }
                slot.insert(engine)
            }
        };
        let raw = engine.extract_text(image_path, OCR_PROMPT, self.config.max_new_tokens)?;
        Ok(postprocess::clean_output(&raw))
    }

    fn progress(&self) -> Option<&ProgressCallback> {
        self.config.progress.as_ref()
    }
}

impl DocumentProcessor for LocalNanonetsProcessor {
    fn name(&self) -> &str {
        PROCESSOR_NAME
    }

    fn supported_formats(&self) -> &[&str] {
        SUPPORTED_FORMATS
    }

    fn can_process(&self, path: &Path) -> bool {
        LocalNanonetsProcessor::can_process(self, path)
    }

    fn process(&self, path: &Path) -> Result<ConversionResult> {
        LocalNanonetsProcessor::process(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unloadable() -> LocalNanonetsProcessor {
        LocalNanonetsProcessor::with_engine_loader(
            ProcessorConfig::default(),
            Box::new(|_| {
                Err(OcrError::GenerationFailed {
                    detail: "no engine in this test".to_string(),
                })
            }),
        )
    }

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(
            normalised_extension(Path::new("scans/Photo.PNG")).as_deref(),
            Some(".png")
        );
        assert_eq!(
            normalised_extension(Path::new("report.pdf")).as_deref(),
            Some(".pdf")
        );
        assert_eq!(normalised_extension(Path::new("no_extension")), None);
    }

    #[test]
    fn supported_formats_cover_images_and_pdf() {
        assert_eq!(
            SUPPORTED_FORMATS,
            &[".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".webp", ".pdf"]
        );
    }

    #[test]
    fn can_process_is_case_insensitive() {
        let p = unloadable();
        assert!(p.can_process("scan.JPEG"));
        assert!(p.can_process("scan.webp"));
        assert!(!p.can_process("notes.txt"));
        assert!(!p.can_process("no_extension"));
    }

    #[test]
    fn missing_file_is_reported_before_any_load() {
        let p = unloadable();
        let err = p.process("definitely/not/here.png").unwrap_err();
        assert!(matches!(err, OcrError::FileNotFound { .. }));
        assert!(!p.is_loaded());
    }

    #[test]
    fn text_files_are_rejected() {
        let p = unloadable();
        let file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .unwrap();
        let err = p.process(file.path()).unwrap_err();
        match err {
            OcrError::UnsupportedFormat { extension, .. } => assert_eq!(extension, ".txt"),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }
}
