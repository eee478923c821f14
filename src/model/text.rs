//! Text decoder: grouped-query attention over a kv-cache, with rotary
//! positions carrying separate temporal, height and width axes. The rotary
//! tables are computed once per forward pass and shared by every layer.

use std::cell::RefCell;

use candle_core::{Result, Tensor};
use candle_nn::kv_cache::KvCache;
use candle_nn::{
    embedding, linear, linear_no_bias, ops, rms_norm, Embedding, Linear, Module, RmsNorm,
    VarBuilder,
};

use super::attention::{
    flash_attn, repeat_kv, rotate_half, scaled_dot_product_attention, select_rope_sections,
    MultiAxisRotaryEmbedding,
};
use super::config::ModelConfig;

/// Position axes carried by every token: temporal, height, width.
pub const POSITION_AXES: usize = 3;

/// Upper bound on cached positions. Covers the largest preprocessed image
/// plus the generation budget; sizing the buffers for the full context
/// window would pre-allocate several gigabytes per layer pair.
const MAX_CACHED_POSITIONS: usize = 32_768;

fn apply_multimodal_rope(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    sections: &[usize],
) -> Result<(Tensor, Tensor)> {
    let cos = select_rope_sections(cos, sections)?;
    let sin = select_rope_sections(sin, sections)?;
    let q_embed = q.broadcast_mul(&cos)?.add(&rotate_half(q)?.broadcast_mul(&sin)?)?;
    let k_embed = k.broadcast_mul(&cos)?.add(&rotate_half(k)?.broadcast_mul(&sin)?)?;
    Ok((q_embed, k_embed))
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = ops::silu(&self.gate_proj.forward(x)?)?;
        self.down_proj.forward(&(gate * self.up_proj.forward(x)?)?)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    mrope_section: Vec<usize>,
    use_flash_attn: bool,
    kv_cache: RefCell<KvCache>,
}

impl Attention {
    fn new(
        cfg: &ModelConfig,
        head_dim: usize,
        use_flash_attn: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_key_value_heads;
        let cache_len = cfg.max_position_embeddings.min(MAX_CACHED_POSITIONS);
        Ok(Self {
            q_proj: linear(cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            mrope_section: cfg.rope_scaling.mrope_section.clone(),
            use_flash_attn,
            kv_cache: RefCell::new(KvCache::new(2, cache_len)),
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = apply_multimodal_rope(&q, &k, cos, sin, &self.mrope_section)?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;
        let (k, v) = self.kv_cache.borrow_mut().append(&k, &v)?;
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        // Prefill needs the causal mask; a single-token decode step sees the
        // whole cache.
        let is_causal = seq_len > 1;
        let attn = if self.use_flash_attn {
            let q = q.transpose(1, 2)?.contiguous()?;
            let k = k.transpose(1, 2)?.contiguous()?;
            let v = v.transpose(1, 2)?.contiguous()?;
            flash_attn(&q, &k, &v, self.scale as f32, is_causal)?
        } else {
            scaled_dot_product_attention(&q, &k, &v, None, self.scale, is_causal)?
                .transpose(1, 2)?
        };
        let attn = attn.reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&attn)
    }

    fn clear_kv_cache(&self) {
        self.kv_cache.borrow_mut().reset();
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        cfg: &ModelConfig,
        head_dim: usize,
        use_flash_attn: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, head_dim, use_flash_attn, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x = (x + self.self_attn.forward(&self.input_layernorm.forward(x)?, cos, sin)?)?;
        let out = (&x + self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?)?;
        Ok(out)
    }
}

pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: MultiAxisRotaryEmbedding,
}

impl TextModel {
    pub fn new(cfg: &ModelConfig, use_flash_attn: bool, vb: VarBuilder) -> Result<Self> {
        if cfg.hidden_size % cfg.num_attention_heads != 0 {
            candle_core::bail!(
                "hidden_size {} not divisible by num_attention_heads {}",
                cfg.hidden_size,
                cfg.num_attention_heads
            )
        }
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let rotary =
            MultiAxisRotaryEmbedding::new(head_dim, cfg.rope_theta, POSITION_AXES, vb.device())?;
        let vb_layers = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::new(cfg, head_dim, use_flash_attn, vb_layers.pp(i))?);
        }
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
        })
    }

    pub fn embed(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(token_ids)
    }

    /// The raw embedding matrix, used as the output head when the checkpoint
    /// ties input and output embeddings.
    pub fn token_embedding_weight(&self) -> Tensor {
        self.embed_tokens.embeddings().clone()
    }

    /// Run the decoder stack. `position_ids` is `(3, batch, seq)` with one
    /// row per position axis.
    pub fn forward(&self, inputs_embeds: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let (cos, sin) = self.rotary.forward(position_ids, inputs_embeds.dtype())?;
        let mut hidden = inputs_embeds.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &cos, &sin)?;
        }
        self.norm.forward(&hidden)
    }

    pub fn clear_kv_cache(&self) {
        for layer in &self.layers {
            layer.self_attn.clear_kv_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{RopeScaling, VisionConfig};
    use candle_core::{DType, Device};

    fn tiny_cfg() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            max_position_embeddings: 64,
            hidden_act: "silu".to_string(),
            tie_word_embeddings: true,
            bos_token_id: 0,
            eos_token_id: 1,
            pad_token_id: None,
            vision_start_token_id: 2,
            vision_end_token_id: 3,
            image_token_id: 4,
            video_token_id: 5,
            rope_scaling: RopeScaling {
                r#type: Some("mrope".to_string()),
                mrope_section: vec![2, 1, 1],
            },
            vision_config: VisionConfig {
                depth: 1,
                hidden_size: 16,
                intermediate_size: 32,
                out_hidden_size: 16,
                hidden_act: "silu".to_string(),
                num_heads: 2,
                in_channels: 3,
                patch_size: 2,
                spatial_merge_size: 2,
                temporal_patch_size: 2,
                window_size: 8,
                fullatt_block_indexes: vec![],
            },
        }
    }

    fn sequential_positions(len: usize, device: &Device) -> Tensor {
        let flat: Vec<i64> = (0..POSITION_AXES as i64)
            .flat_map(|_| 0..len as i64)
            .collect();
        Tensor::from_vec(flat, (POSITION_AXES, 1, len), device).unwrap()
    }

    #[test]
    fn prefill_then_decode_step() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = TextModel::new(&cfg, false, vb).unwrap();

        let tokens = Tensor::from_vec(vec![6u32, 7, 8, 9], (1, 4), &device).unwrap();
        let embeds = model.embed(&tokens).unwrap();
        assert_eq!(embeds.dims(), &[1, 4, 16]);

        let hidden = model.forward(&embeds, &sequential_positions(4, &device)).unwrap();
        assert_eq!(hidden.dims(), &[1, 4, 16]);

        // One decode step on top of the cached prefix.
        let step = Tensor::from_vec(vec![10u32], (1, 1), &device).unwrap();
        let step_embeds = model.embed(&step).unwrap();
        let positions = Tensor::from_vec(vec![4i64, 4, 4], (POSITION_AXES, 1, 1), &device).unwrap();
        let hidden = model.forward(&step_embeds, &positions).unwrap();
        assert_eq!(hidden.dims(), &[1, 1, 16]);

        // After a reset the same prefill shape runs again.
        model.clear_kv_cache();
        let hidden = model
            .forward(&embeds, &sequential_positions(4, &device))
            .unwrap();
        assert_eq!(hidden.dims(), &[1, 4, 16]);
    }

    #[test]
    fn tied_embedding_weight_shape() {
        let cfg = tiny_cfg();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = TextModel::new(&cfg, false, vb).unwrap();
        assert_eq!(model.token_embedding_weight().dims(), &[32, 16]);
    }
}
