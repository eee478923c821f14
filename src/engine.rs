//! Inference seam between the document pipeline and the model.
//!
//! [`LocalNanonetsProcessor`](crate::processor::LocalNanonetsProcessor) drives
//! everything above this trait: format dispatch, PDF rasterisation, temp-file
//! management, page assembly. Everything below it (tokenisation, the
//! transformer forward pass, greedy decoding) lives behind [`OcrEngine`].
//! Tests substitute a scripted engine here so the pipeline's dispatch,
//! cleanup, and retry behaviour can be exercised without loading gigabytes
//! of weights.

use std::path::Path;

use crate::error::Result;

/// A loaded OCR model that turns one image into text.
///
/// Implementations own their weights, tokenizer, and KV cache, so calls take
/// `&mut self` and a single engine must not be shared across threads
/// mid-generation. The trait is `Send` so the engine can live inside the
/// processor's `Mutex` and move with it.
pub trait OcrEngine: Send {
    /// The fully-qualified model identifier this engine was loaded from
    /// (e.g. `"nanonets/Nanonets-OCR2-3B"`).
    fn model_id(&self) -> &str;

    /// Run OCR over a single image file and return the raw model output.
    ///
    /// # Arguments
    /// * `image`          - path to a decodable raster image (PNG, JPEG, ...)
    /// * `prompt`         - the extraction instruction appended after the image
    /// * `max_new_tokens` - hard cap on generated tokens; generation also stops
    ///   at the model's end-of-turn token
    ///
    /// The returned string contains only newly generated text. The prompt and
    /// any chat-template scaffolding are never echoed back.
    fn extract_text(
        &mut self,
        image: &Path,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<String>;
}
