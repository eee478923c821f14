//! Document-preparation stages that run before the model sees a page.
//!
//! Each submodule implements exactly one transformation step. Keeping stages
//! separate makes each independently testable and lets us swap
//! implementations (e.g. switch rendering backend) without touching other
//! stages.
//!
//! ## Data Flow
//!
//! ```text
//! PDF ──▶ render ──▶ temp PNG ──▶ model ──▶ postprocess
//!         (pdfium)   (per page)   (OCR)     (cleanup)
//! ```
//!
//! 1. [`render`] rasterises every page of a PDF to in-memory RGB images
//! 2. [`postprocess`] applies deterministic text-cleanup rules to the raw
//!    model output (stray markdown fences, line endings, blank-line runs)

pub mod postprocess;
pub mod render;
