//! Prompts sent to the vision-language model.
//!
//! Centralising them here serves two purposes:
//!
//! 1. **Single source of truth** — the OCR instruction defines the output
//!    contract (HTML tables, LaTeX equations, tag conventions); changing it
//!    means editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect the prompts directly without
//!    loading a model.
//!
//! The instruction text matches what Nanonets-OCR2 was fine-tuned against.
//! Rewording it degrades output quality, so treat it as part of the model
//! contract rather than as copy to polish.

/// System message opening every conversation.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// The per-image OCR instruction, sent alongside the image.
pub const OCR_PROMPT: &str = "Extract the text from the above document as if you were reading it naturally. Return the tables in html format. Return the equations in LaTeX representation. If there is an image in the document and image caption is not present, add a small description of the image inside the <img></img> tag; otherwise, add the image caption inside <img></img>. Watermarks should be wrapped in brackets. Ex: <watermark>OFFICIAL COPY</watermark>. Page numbers should be wrapped in brackets. Ex: <page_number>14</page_number> or <page_number>9/22</page_number>. Prefer using \u{2610} and \u{2611} for check boxes.";
