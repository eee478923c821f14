//! The Nanonets-OCR2 engine: a Qwen2.5-VL-family checkpoint loaded from the
//! Hugging Face hub and driven through candle.
//!
//! [`NanonetsEngine::load`] fetches `config.json`, `preprocessor_config.json`,
//! `tokenizer.json` and the safetensors weights, then wires up the vision
//! tower and text decoder on the resolved device. [`OcrEngine::extract_text`]
//! renders the chat template around one image, splices the vision embeddings
//! over the placeholder tokens, and decodes greedily until end-of-turn or the
//! token ceiling.

pub mod attention;
pub mod config;
pub mod processing;
pub mod text;
pub mod vision;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::ProcessorConfig;
use crate::device::AttentionBackend;
use crate::engine::OcrEngine;
use crate::error::{OcrError, Result};
use crate::prompts::SYSTEM_PROMPT;

use self::config::{ModelConfig, PreprocessorConfig};
use self::processing::{build_prompt, expand_image_tokens, preprocess};
use self::text::{TextModel, POSITION_AXES};
use self::vision::VisionModel;

const IMAGE_PAD_TOKEN: &str = "<|image_pad|>";
const END_OF_TURN_TOKEN: &str = "<|im_end|>";

struct ModelFiles {
    config: PathBuf,
    preprocessor: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: BTreeMap<String, String>,
}

/// Download (or reuse from the hub cache) every file the engine needs.
/// Weights are either a single `model.safetensors` or the shards listed in
/// `model.safetensors.index.json`.
fn fetch_model_files(model_id: &str, revision: &str) -> Result<ModelFiles> {
    let fail = |detail: String| OcrError::ModelLoadFailed {
        model_id: model_id.to_string(),
        detail,
    };
    let api = Api::new().map_err(|e| fail(format!("hub client: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    let config = repo
        .get("config.json")
        .map_err(|e| fail(format!("config.json: {e}")))?;
    let preprocessor = repo
        .get("preprocessor_config.json")
        .map_err(|e| fail(format!("preprocessor_config.json: {e}")))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| fail(format!("tokenizer.json: {e}")))?;
    let weights = match repo.get("model.safetensors") {
        Ok(single) => vec![single],
        Err(_) => {
            let index_path = repo
                .get("model.safetensors.index.json")
                .map_err(|e| fail(format!("model.safetensors.index.json: {e}")))?;
            let contents = std::fs::read_to_string(&index_path)
                .map_err(|e| fail(format!("reading weight index: {e}")))?;
            let index: SafetensorsIndex = serde_json::from_str(&contents)
                .map_err(|e| fail(format!("parsing weight index: {e}")))?;
            let shards: BTreeSet<String> = index.weight_map.into_values().collect();
            if shards.is_empty() {
                return Err(fail("weight index lists no shards".to_string()));
            }
            let mut paths = Vec::with_capacity(shards.len());
            for shard in shards {
                paths.push(repo.get(&shard).map_err(|e| fail(format!("{shard}: {e}")))?);
            }
            paths
        }
    };
    Ok(ModelFiles {
        config,
        preprocessor,
        tokenizer,
        weights,
    })
}

/// Per-token positions for the temporal, height and width rotary axes.
///
/// Text tokens advance all three axes in lockstep. An image placeholder run
/// is laid out as a grid: every patch cell keeps the same temporal
/// coordinate while rows and columns count across the merged grid, starting
/// one past the highest position used so far. Returns the `(3, 1, len)`
/// position tensor and the delta to add to the sequence length to find the
/// first decode position.
fn get_rope_index(
    tokens: &[u32],
    grid_thw: (usize, usize, usize),
    merge_size: usize,
    image_token_id: u32,
    video_token_id: u32,
    device: &Device,
) -> candle_core::Result<(Tensor, i64)> {
    let len = tokens.len();
    let mut t_pos: Vec<i64> = Vec::with_capacity(len);
    let mut h_pos: Vec<i64> = Vec::with_capacity(len);
    let mut w_pos: Vec<i64> = Vec::with_capacity(len);
    let mut current_max: i64 = -1;
    let mut i = 0;
    while i < len {
        let token = tokens[i];
        if token == video_token_id {
            candle_core::bail!("video inputs are not supported")
        }
        if token == image_token_id {
            let (grid_t, grid_h, grid_w) = grid_thw;
            let llm_h = grid_h / merge_size;
            let llm_w = grid_w / merge_size;
            let block = grid_t * llm_h * llm_w;
            if i + block > len || tokens[i..i + block].iter().any(|&t| t != image_token_id) {
                candle_core::bail!(
                    "image placeholder run does not match the image grid {grid_thw:?}"
                )
            }
            let base = current_max + 1;
            for tt in 0..grid_t {
                for hh in 0..llm_h {
                    for ww in 0..llm_w {
                        t_pos.push(base + tt as i64);
                        h_pos.push(base + hh as i64);
                        w_pos.push(base + ww as i64);
                    }
                }
            }
            let extent = grid_t.max(llm_h).max(llm_w) as i64;
            current_max = current_max.max(base + extent - 1);
            i += block;
        } else {
            let p = current_max + 1;
            t_pos.push(p);
            h_pos.push(p);
            w_pos.push(p);
            current_max = p;
            i += 1;
        }
    }
    let rope_delta = (current_max + 1) - len as i64;
    let mut flat = t_pos;
    flat.extend_from_slice(&h_pos);
    flat.extend_from_slice(&w_pos);
    let position_ids = Tensor::from_vec(flat, (POSITION_AXES, 1, len), device)?;
    Ok((position_ids, rope_delta))
}

/// Replace the run of placeholder embeddings with the vision tower's rows.
fn splice_image_embeddings(
    text_embeds: &Tensor,
    image_embeds: &Tensor,
    tokens: &[u32],
    image_token_id: u32,
) -> candle_core::Result<Tensor> {
    let image_len = image_embeds.dim(0)?;
    let start = match tokens.iter().position(|&t| t == image_token_id) {
        Some(p) => p,
        None => candle_core::bail!("prompt contains no image placeholder tokens"),
    };
    let seq_len = tokens.len();
    if start + image_len > seq_len {
        candle_core::bail!(
            "vision output ({image_len} rows) overruns the placeholder run at {start}"
        )
    }
    let prefix = text_embeds.narrow(1, 0, start)?;
    let suffix = text_embeds.narrow(1, start + image_len, seq_len - start - image_len)?;
    let image = image_embeds.unsqueeze(0)?.to_dtype(text_embeds.dtype())?;
    Tensor::cat(&[&prefix, &image, &suffix], 1)
}

/// Greedy pick over a `(1, vocab)` logits row. NaN entries are skipped so a
/// single bad value cannot hijack the whole generation.
fn argmax_token(logits: &Tensor) -> candle_core::Result<u32> {
    let values = logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (idx, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        if value > best_value {
            best_value = value;
            best = idx;
        }
    }
    Ok(best as u32)
}

/// A fully loaded OCR model: tokenizer, vision tower, text decoder and
/// output head, pinned to one device and dtype.
pub struct NanonetsEngine {
    model_id: String,
    tokenizer: Tokenizer,
    text: TextModel,
    vision: VisionModel,
    lm_head: Linear,
    model_cfg: ModelConfig,
    preprocessor_cfg: PreprocessorConfig,
    device: Device,
    dtype: DType,
    eos_token_ids: Vec<u32>,
}

impl NanonetsEngine {
    /// Fetch the model artifacts and build the engine. The first call
    /// downloads several gigabytes of weights into the hub cache; later
    /// calls reuse the cache and only pay the mmap plus graph construction.
    pub fn load(config: &ProcessorConfig) -> Result<Self> {
        let started = Instant::now();
        let selection = config.device.resolve()?;
        info!(
            model_id = %config.model_id,
            revision = %config.revision,
            device = %selection.describe(),
            "loading OCR model"
        );
        let fail = |detail: String| OcrError::ModelLoadFailed {
            model_id: config.model_id.clone(),
            detail,
        };

        let files = fetch_model_files(&config.model_id, &config.revision)?;
        let model_cfg = ModelConfig::from_path(&files.config).map_err(|e| fail(e.to_string()))?;
        model_cfg.validate().map_err(|e| fail(e.to_string()))?;
        let preprocessor_cfg =
            PreprocessorConfig::from_path(&files.preprocessor).map_err(|e| fail(e.to_string()))?;
        preprocessor_cfg.validate().map_err(|e| fail(e.to_string()))?;
        if preprocessor_cfg.merge_size != model_cfg.vision_config.spatial_merge_size
            || preprocessor_cfg.patch_size != model_cfg.vision_config.patch_size
        {
            return Err(fail(format!(
                "preprocessor patch/merge ({}, {}) disagrees with the vision config ({}, {})",
                preprocessor_cfg.patch_size,
                preprocessor_cfg.merge_size,
                model_cfg.vision_config.patch_size,
                model_cfg.vision_config.spatial_merge_size,
            )));
        }

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| fail(format!("tokenizer.json: {e}")))?;
        match tokenizer.token_to_id(IMAGE_PAD_TOKEN) {
            Some(id) if id == model_cfg.image_token_id => {}
            other => {
                return Err(fail(format!(
                    "tokenizer maps {IMAGE_PAD_TOKEN} to {other:?} but the config expects {}",
                    model_cfg.image_token_id
                )))
            }
        }

        let use_flash_attn = selection.attention == AttentionBackend::FlashAttention2;
        // SAFETY: the safetensors files live in the hub cache and are mapped
        // read-only; nothing truncates or rewrites them while the engine is
        // alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files.weights, selection.dtype, &selection.device)
        }
        .map_err(|e| fail(format!("mapping weights: {e}")))?;
        let text = TextModel::new(&model_cfg, use_flash_attn, vb.pp("model"))
            .map_err(|e| fail(format!("text decoder: {e}")))?;
        let vision = VisionModel::new(&model_cfg.vision_config, vb.pp("visual"))
            .map_err(|e| fail(format!("vision tower: {e}")))?;
        let lm_head = if model_cfg.tie_word_embeddings {
            Linear::new(text.token_embedding_weight(), None)
        } else {
            linear_no_bias(model_cfg.hidden_size, model_cfg.vocab_size, vb.pp("lm_head"))
                .map_err(|e| fail(format!("lm_head: {e}")))?
        };

        let mut eos_token_ids = vec![model_cfg.eos_token_id];
        if let Some(id) = tokenizer.token_to_id(END_OF_TURN_TOKEN) {
            if !eos_token_ids.contains(&id) {
                eos_token_ids.push(id);
            }
        }

        info!(elapsed = ?started.elapsed(), "model ready");
        Ok(Self {
            model_id: config.model_id.clone(),
            tokenizer,
            text,
            vision,
            lm_head,
            model_cfg,
            preprocessor_cfg,
            device: selection.device,
            dtype: selection.dtype,
            eos_token_ids,
        })
    }
}

impl OcrEngine for NanonetsEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn extract_text(
        &mut self,
        image: &Path,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<String> {
        let started = Instant::now();
        let img = image::open(image).map_err(|e| OcrError::ImageDecodeFailed {
            path: image.to_path_buf(),
            detail: e.to_string(),
        })?;

        let inputs = preprocess(&img, &self.preprocessor_cfg, &self.device, self.dtype)?;
        let merge = self.preprocessor_cfg.merge_size;
        let image_tokens = inputs.token_count(merge);
        debug!(grid = ?inputs.grid_thw, image_tokens, "image preprocessed");

        let rendered = build_prompt(SYSTEM_PROMPT, prompt);
        let encoding =
            self.tokenizer
                .encode(rendered, false)
                .map_err(|e| OcrError::GenerationFailed {
                    detail: format!("prompt tokenization: {e}"),
                })?;
        let tokens = expand_image_tokens(
            encoding.get_ids(),
            self.model_cfg.image_token_id,
            image_tokens,
        );
        let seq_len = tokens.len();

        let image_embeds = self.vision.forward(&inputs.pixel_values, inputs.grid_thw)?;
        let token_tensor = Tensor::from_vec(tokens.clone(), (1, seq_len), &self.device)?;
        let text_embeds = self.text.embed(&token_tensor)?;
        let embeds = splice_image_embeddings(
            &text_embeds,
            &image_embeds,
            &tokens,
            self.model_cfg.image_token_id,
        )?;

        let (position_ids, rope_delta) = get_rope_index(
            &tokens,
            inputs.grid_thw,
            merge,
            self.model_cfg.image_token_id,
            self.model_cfg.video_token_id,
            &self.device,
        )?;

        self.text.clear_kv_cache();
        let hidden = self.text.forward(&embeds, &position_ids)?;
        let last = hidden.i((0, seq_len - 1, ..))?.unsqueeze(0)?;
        let mut next = argmax_token(&self.lm_head.forward(&last)?)?;

        // Only freshly generated tokens are collected; the prompt is never
        // part of the output.
        let mut generated: Vec<u32> = Vec::new();
        let mut pos = seq_len as i64 + rope_delta;
        loop {
            if self.eos_token_ids.contains(&next) {
                break;
            }
            generated.push(next);
            if generated.len() >= max_new_tokens {
                debug!(max_new_tokens, "generation hit the token ceiling");
                break;
            }
            let step = Tensor::from_vec(vec![next], (1, 1), &self.device)?;
            let step_embeds = self.text.embed(&step)?;
            let positions =
                Tensor::from_vec(vec![pos; POSITION_AXES], (POSITION_AXES, 1, 1), &self.device)?;
            let hidden = self.text.forward(&step_embeds, &positions)?;
            let last = hidden.i((0, 0, ..))?.unsqueeze(0)?;
            next = argmax_token(&self.lm_head.forward(&last)?)?;
            pos += 1;
        }

        let output = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| OcrError::GenerationFailed {
                detail: format!("detokenization: {e}"),
            })?;
        info!(
            prompt_tokens = seq_len,
            new_tokens = generated.len(),
            elapsed = ?started.elapsed(),
            "page transcribed"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rope_index_for_plain_text() {
        let device = Device::Cpu;
        let tokens = vec![10u32, 11, 12];
        let (positions, delta) =
            get_rope_index(&tokens, (1, 4, 4), 2, 9, 5, &device).unwrap();
        let rows = positions.to_vec3::<i64>().unwrap();
        for axis in &rows {
            assert_eq!(axis[0], vec![0, 1, 2]);
        }
        assert_eq!(delta, 0);
    }

    #[test]
    fn rope_index_lays_grid_over_image_run() {
        let device = Device::Cpu;
        // One leading text token, a 2x2 merged-cell image, one trailing token.
        let tokens = vec![7u32, 9, 9, 9, 9, 8];
        let (positions, delta) =
            get_rope_index(&tokens, (1, 4, 4), 2, 9, 5, &device).unwrap();
        let rows = positions.to_vec3::<i64>().unwrap();
        assert_eq!(rows[0][0], vec![0, 1, 1, 1, 1, 3]);
        assert_eq!(rows[1][0], vec![0, 1, 1, 2, 2, 3]);
        assert_eq!(rows[2][0], vec![0, 1, 2, 1, 2, 3]);
        // The next decode position is 4, two behind the sequence length.
        assert_eq!(delta, -2);
    }

    #[test]
    fn rope_index_rejects_video_tokens() {
        let device = Device::Cpu;
        assert!(get_rope_index(&[7u32, 5, 8], (1, 4, 4), 2, 9, 5, &device).is_err());
    }

    #[test]
    fn rope_index_rejects_short_placeholder_run() {
        let device = Device::Cpu;
        // Grid wants four placeholders, prompt has two.
        assert!(get_rope_index(&[7u32, 9, 9, 8], (1, 4, 4), 2, 9, 5, &device).is_err());
    }

    #[test]
    fn argmax_ignores_nan() {
        let device = Device::Cpu;
        let logits =
            Tensor::from_vec(vec![f32::NAN, 1.0, 3.0, 2.0], (1, 4), &device).unwrap();
        assert_eq!(argmax_token(&logits).unwrap(), 2);
    }

    #[test]
    fn splice_replaces_placeholder_rows() {
        let device = Device::Cpu;
        let text = Tensor::from_vec(
            (0..20).map(|v| v as f32).collect::<Vec<_>>(),
            (1, 5, 4),
            &device,
        )
        .unwrap();
        let image = Tensor::full(7.0f32, (3, 4), &device).unwrap();
        let tokens = vec![1u32, 9, 9, 9, 2];
        let out = splice_image_embeddings(&text, &image, &tokens, 9).unwrap();
        assert_eq!(out.dims(), &[1, 5, 4]);
        let rows = out.to_vec3::<f32>().unwrap();
        assert_eq!(rows[0][0], vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(rows[0][1], vec![7.0; 4]);
        assert_eq!(rows[0][3], vec![7.0; 4]);
        assert_eq!(rows[0][4], vec![16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn sharded_index_lists_unique_shards() {
        let raw = r#"{
            "metadata": { "total_size": 123 },
            "weight_map": {
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors",
                "visual.patch_embed.proj.weight": "model-00001-of-00002.safetensors"
            }
        }"#;
        let index: SafetensorsIndex = serde_json::from_str(raw).unwrap();
        let shards: BTreeSet<String> = index.weight_map.into_values().collect();
        assert_eq!(
            shards.into_iter().collect::<Vec<_>>(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }
}
