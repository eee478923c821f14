//! Configuration for the OCR processor.
//!
//! Every knob lives in [`ProcessorConfig`], built via its
//! [`ProcessorConfigBuilder`]. Keeping them in one struct makes it trivial to
//! share a config between the library, the CLI, and tests, and to log the
//! exact settings a run used.
//!
//! # Design choice: builder over constructor
//! Callers usually want the defaults (the published model, auto device, 2x
//! page scale) and override one field at most. The builder lets them set only
//! what they care about and documents each default where it is defined.

use crate::device::DevicePreference;
use crate::error::OcrError;
use crate::progress::ProgressCallback;
use std::fmt;

/// The model repository this crate was built around.
pub const DEFAULT_MODEL_ID: &str = "nanonets/Nanonets-OCR2-3B";

/// Configuration for [`crate::LocalNanonetsProcessor`].
///
/// Built via [`ProcessorConfig::builder()`] or [`ProcessorConfig::default()`].
///
/// # Example
/// ```rust
/// use docstrange_ocr::ProcessorConfig;
///
/// let config = ProcessorConfig::builder()
///     .max_new_tokens(2048)
///     .render_scale(2.0)
///     .build()
///     .unwrap();
/// assert_eq!(config.model_id, "nanonets/Nanonets-OCR2-3B");
/// ```
#[derive(Clone)]
pub struct ProcessorConfig {
    /// Hugging Face model repository id. Default: `nanonets/Nanonets-OCR2-3B`.
    ///
    /// Any Qwen2.5-VL-family repository with the standard file layout
    /// (`config.json`, `tokenizer.json`, `preprocessor_config.json`,
    /// safetensors weights) will load; the default is the OCR fine-tune the
    /// prompts in this crate are written for.
    pub model_id: String,

    /// Git revision to fetch from the hub. Default: `main`.
    pub revision: String,

    /// Maximum tokens the model may generate per image. Default: 4096.
    ///
    /// Dense pages (full tables, forms) routinely need 2 000+ output tokens.
    /// Setting this too low truncates the transcript mid-sentence; generation
    /// stops early on EOS anyway, so the ceiling only bounds the worst case.
    pub max_new_tokens: usize,

    /// Scale factor applied when rasterising PDF pages. Range: 1.0–4.0.
    /// Default: 2.0.
    ///
    /// 2x of the PDF's nominal size puts body text at roughly 150 DPI, which
    /// is enough for the model to read reliably. Higher scales grow the
    /// vision sequence (and latency) quadratically with little accuracy gain.
    pub render_scale: f32,

    /// Which device to run inference on. Default: [`DevicePreference::Auto`]
    /// (CUDA device 0 when available, else CPU).
    pub device: DevicePreference,

    /// Optional progress observer. Default: `None` (the library never prints).
    pub progress: Option<ProgressCallback>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            max_new_tokens: 4096,
            render_scale: 2.0,
            device: DevicePreference::Auto,
            progress: None,
        }
    }
}

impl fmt::Debug for ProcessorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorConfig")
            .field("model_id", &self.model_id)
            .field("revision", &self.revision)
            .field("max_new_tokens", &self.max_new_tokens)
            .field("render_scale", &self.render_scale)
            .field("device", &self.device)
            .field("progress", &self.progress.as_ref().map(|_| "<dyn OcrProgressCallback>"))
            .finish()
    }
}

impl ProcessorConfig {
    /// Create a new builder for `ProcessorConfig`.
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder {
            config: Self::default(),
        }
    }

    /// The model name recorded in result metadata: the repository basename,
    /// so `nanonets/Nanonets-OCR2-3B` reports as `Nanonets-OCR2-3B`.
    pub fn model_name(&self) -> &str {
        self.model_id
            .rsplit('/')
            .next()
            .unwrap_or(self.model_id.as_str())
    }
}

/// Builder for [`ProcessorConfig`].
#[derive(Debug)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    pub fn model_id(mut self, id: impl Into<String>) -> Self {
        self.config.model_id = id.into();
        self
    }

    pub fn revision(mut self, rev: impl Into<String>) -> Self {
        self.config.revision = rev.into();
        self
    }

    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.config.max_new_tokens = n.max(1);
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale.clamp(1.0, 4.0);
        self
    }

    pub fn device(mut self, pref: DevicePreference) -> Self {
        self.config.device = pref;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessorConfig, OcrError> {
        let c = &self.config;
        if c.model_id.trim().is_empty() {
            return Err(OcrError::InvalidConfig("model_id must not be empty".into()));
        }
        if !(1.0..=4.0).contains(&c.render_scale) {
            return Err(OcrError::InvalidConfig(format!(
                "render_scale must be 1.0–4.0, got {}",
                c.render_scale
            )));
        }
        if c.max_new_tokens == 0 {
            return Err(OcrError::InvalidConfig("max_new_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_model() {
        let c = ProcessorConfig::default();
        assert_eq!(c.model_id, "nanonets/Nanonets-OCR2-3B");
        assert_eq!(c.revision, "main");
        assert_eq!(c.max_new_tokens, 4096);
        assert_eq!(c.render_scale, 2.0);
    }

    #[test]
    fn builder_clamps_out_of_range_values() {
        let c = ProcessorConfig::builder()
            .render_scale(10.0)
            .max_new_tokens(0)
            .build()
            .unwrap();
        assert_eq!(c.render_scale, 4.0);
        assert_eq!(c.max_new_tokens, 1);
    }

    #[test]
    fn empty_model_id_is_rejected() {
        let err = ProcessorConfig::builder().model_id("  ").build();
        assert!(matches!(err, Err(OcrError::InvalidConfig(_))));
    }

    #[test]
    fn model_name_strips_org_prefix() {
        let c = ProcessorConfig::default();
        assert_eq!(c.model_name(), "Nanonets-OCR2-3B");

        let c = ProcessorConfig::builder()
            .model_id("local-fork")
            .build()
            .unwrap();
        assert_eq!(c.model_name(), "local-fork");
    }
}
