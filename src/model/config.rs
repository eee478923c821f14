//! Serde mappings for the model artifacts fetched from the Hub:
//! `config.json` and `preprocessor_config.json`.

use serde::Deserialize;
use std::path::Path;

use crate::error::{OcrError, Result};

fn default_text_hidden_act() -> String {
    "silu".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

/// `rope_scaling` block: multimodal rotary embedding section split.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RopeScaling {
    #[serde(default, alias = "rope_type")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub mrope_section: Vec<usize>,
}

/// Vision-tower half of `config.json`.
///
/// `hidden_size` here is the tower's internal width; `out_hidden_size` is the
/// language model's width that the patch merger projects into.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub depth: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub out_hidden_size: usize,
    #[serde(default = "default_text_hidden_act")]
    pub hidden_act: String,
    pub num_heads: usize,
    #[serde(alias = "in_chans", alias = "in_channels")]
    pub in_channels: usize,
    pub patch_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
    /// Side length, in pixels, of the square windows used by the windowed
    /// attention blocks.
    pub window_size: usize,
    /// Block indices that attend over the full sequence instead of windows.
    #[serde(default)]
    pub fullatt_block_indexes: Vec<usize>,
}

impl VisionConfig {
    pub fn head_dim(&self) -> Result<usize> {
        if self.hidden_size % self.num_heads != 0 {
            return Err(OcrError::InvalidConfig(format!(
                "vision hidden_size {} not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        Ok(self.hidden_size / self.num_heads)
    }

    /// Window side length in merged-cell units. The attention windows span
    /// `window_size` pixels; each merged cell covers
    /// `spatial_merge_size * patch_size` pixels.
    pub fn merger_window_size(&self) -> usize {
        self.window_size / self.spatial_merge_size / self.patch_size
    }
}

/// Top-level `config.json` of the model repository.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    #[serde(default = "default_text_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    pub vision_start_token_id: u32,
    pub vision_end_token_id: u32,
    pub image_token_id: u32,
    pub video_token_id: u32,
    #[serde(default)]
    pub rope_scaling: RopeScaling,
    pub vision_config: VisionConfig,
}

impl ModelConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OcrError::InvalidConfig(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| OcrError::InvalidConfig(format!("failed to parse config.json: {e}")))
    }

    pub fn head_dim(&self) -> Result<usize> {
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(OcrError::InvalidConfig(format!(
                "hidden_size {} not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(self.hidden_size / self.num_attention_heads)
    }

    pub fn validate(&self) -> Result<()> {
        let head_dim = self.head_dim()?;
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(OcrError::InvalidConfig(format!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        let section_sum: usize = self.rope_scaling.mrope_section.iter().sum();
        if section_sum * 2 != head_dim {
            return Err(OcrError::InvalidConfig(format!(
                "mrope_section sum ({section_sum}) * 2 != head_dim ({head_dim})"
            )));
        }
        Ok(())
    }
}

/// `preprocessor_config.json`: resize bounds and normalisation constants.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default)]
    pub min_pixels: Option<u32>,
    #[serde(default)]
    pub max_pixels: Option<u32>,
    #[serde(default)]
    pub size: Option<PixelBounds>,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub merge_size: usize,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
    /// PIL resampling constant; 3 is bicubic.
    #[serde(default)]
    pub resample: Option<u32>,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
}

/// Newer processor configs carry pixel bounds under `size` instead of
/// top-level `min_pixels`/`max_pixels`.
#[derive(Debug, Clone, Deserialize)]
pub struct PixelBounds {
    pub shortest_edge: u32,
    pub longest_edge: u32,
}

impl PreprocessorConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OcrError::InvalidConfig(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            OcrError::InvalidConfig(format!("failed to parse preprocessor_config.json: {e}"))
        })
    }

    pub fn pixel_bounds(&self) -> Result<(u32, u32)> {
        if let Some(size) = &self.size {
            return Ok((size.shortest_edge, size.longest_edge));
        }
        match (self.min_pixels, self.max_pixels) {
            (Some(min_pixels), Some(max_pixels)) => Ok((min_pixels, max_pixels)),
            _ => Err(OcrError::InvalidConfig(
                "preprocessor_config missing size or min/max pixels".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.do_normalize {
            if self.image_mean.len() != 3 || self.image_std.len() != 3 {
                return Err(OcrError::InvalidConfig(format!(
                    "image_mean/std must have length 3, got mean={} std={}",
                    self.image_mean.len(),
                    self.image_std.len()
                )));
            }
            if self.image_std.contains(&0.0) {
                return Err(OcrError::InvalidConfig(
                    "image_std values must be non-zero".to_string(),
                ));
            }
        }
        if self.patch_size == 0 || self.merge_size == 0 || self.temporal_patch_size == 0 {
            return Err(OcrError::InvalidConfig(
                "patch_size/merge_size/temporal_patch_size must be > 0".to_string(),
            ));
        }
        if self.do_resize {
            let (min_pixels, max_pixels) = self.pixel_bounds()?;
            if min_pixels == 0 || max_pixels == 0 || min_pixels > max_pixels {
                return Err(OcrError::InvalidConfig(format!(
                    "invalid pixel bounds: min={min_pixels} max={max_pixels}"
                )));
            }
        }
        if self.do_rescale && self.rescale_factor <= 0.0 {
            return Err(OcrError::InvalidConfig(
                "rescale_factor must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
