//! Error types for the docstrange-ocr library.
//!
//! One enum covers every failure the pipeline can hit. There is no
//! page-level error type: a page failure aborts the remaining pages of a
//! PDF, so nothing survives to be collected per page. The policy everywhere
//! is log-then-propagate: callers get the original failure via `Result`,
//! never a retried or partially-recovered one.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, OcrError>;

/// All errors returned by the docstrange-ocr library.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The file extension is not in the supported set.
    #[error(
        "Unsupported file type '{extension}' for '{path}'\n\
Supported: .jpg .jpeg .png .bmp .tiff .webp .pdf"
    )]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// The image file exists but could not be decoded.
    #[error("Failed to decode image '{path}': {detail}")]
    ImageDecodeFailed { path: PathBuf, detail: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// The PDF is encrypted; this pipeline does not take passwords.
    #[error("PDF '{path}' is password-protected.\nDecrypt it first, e.g.: qpdf --password=PW --decrypt in.pdf out.pdf")]
    PasswordProtected { path: PathBuf },

    /// pdfium returned an error while rasterising a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    PageRenderFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDF support needs the pdfium shared library on the loader path.\n\
  • Download a prebuilt libpdfium from bblanchon/pdfium-binaries.\n\
  • Place it next to the executable or set LD_LIBRARY_PATH to its directory.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Model errors ──────────────────────────────────────────────────────
    /// Fetching or initialising the model artifact failed.
    #[error(
        "Failed to load model '{model_id}': {detail}\n\
The first run downloads several GB of weights from the Hugging Face Hub;\n\
check your network connection and disk space, then retry."
    )]
    ModelLoadFailed { model_id: String, detail: String },

    /// The forward pass or token decode failed after a successful load.
    #[error("Text generation failed: {detail}")]
    GenerationFailed { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a per-page temporary image.
    #[error("Failed to write temporary page image: {source}")]
    TempFileFailed {
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Tensor-op failures inside a running forward pass are generation failures.
/// Load-time candle errors are mapped to [`OcrError::ModelLoadFailed`]
/// explicitly at the call sites instead.
impl From<candle_core::Error> for OcrError {
    fn from(e: candle_core::Error) -> Self {
        OcrError::GenerationFailed {
            detail: e.to_string(),
        }
    }
}
