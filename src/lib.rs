//! # docstrange-ocr
//!
//! Local document OCR with the Nanonets-OCR2-3B vision-language model.
//!
//! ## Why this crate?
//!
//! Classic OCR stacks emit flat text: reading order, tables, checkboxes and
//! equations come out garbled or disappear. This crate rasterises documents
//! and lets a vision-language model read each page as a human would,
//! producing markdown with HTML tables, LaTeX equations, and semantic tags
//! for images, watermarks and page numbers. Everything runs on this machine:
//! the first call downloads the published weights into the Hugging Face
//! cache, and no account or API key is involved at any point.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image / PDF
//!  │
//!  ├─ 1. Dispatch    extension routing (DocumentExtractor)
//!  ├─ 2. Render      PDF pages → temporary PNGs at 2x via pdfium
//!  ├─ 3. Preprocess  resize to the patch grid, normalise, patchify
//!  ├─ 4. Model       vision tower + text decoder, greedy decoding
//!  ├─ 5. Polish      fence stripping, whitespace normalisation
//!  └─ 6. Result      markdown + metadata (processor, model, file info)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docstrange_ocr::DocumentExtractor;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let extractor = DocumentExtractor::new();
//!     let result = extractor.extract("invoice.pdf")?;
//!     println!("{}", result.extract_markdown());
//!     println!("model: {:?}", result.metadata_value("model"));
//!     Ok(())
//! }
//! ```
//!
//! The first run blocks while several gigabytes of weights download; later
//! runs reuse the cache and only pay model startup.
//!
//! ## Feature Flags
//!
//! | Feature      | Default | Description                                       |
//! |--------------|---------|---------------------------------------------------|
//! | `cli`        | on      | The `docstrange` and `docstrange-verify` binaries |
//! | `cuda`       | off     | CUDA inference (float16)                          |
//! | `flash-attn` | off     | Fused attention kernels on CUDA; implies `cuda`   |
//!
//! Library-only consumers can drop the CLI dependencies:
//! ```toml
//! docstrange-ocr = { version = "0.1", default-features = false }
//! ```
//!
//! CPU inference works everywhere but is slow for real documents; a CUDA
//! build is strongly recommended for multi-page PDFs.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod prompts;
pub mod result;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ProcessorConfig, ProcessorConfigBuilder, DEFAULT_MODEL_ID};
pub use device::{AttentionBackend, DevicePreference, DeviceSelection};
pub use engine::OcrEngine;
pub use error::{OcrError, Result};
pub use extractor::{DocumentExtractor, DocumentProcessor};
pub use model::NanonetsEngine;
pub use processor::{EngineLoader, LocalNanonetsProcessor, PROCESSOR_NAME, SUPPORTED_FORMATS};
pub use progress::{NoopProgressCallback, OcrProgressCallback, ProgressCallback};
pub use result::ConversionResult;
