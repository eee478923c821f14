//! Attention primitives shared by the vision tower and the text decoder.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::ops;

/// Plain softmax attention. Scores are computed in the input dtype, the
/// softmax runs in f32 for stability, and the result is cast back.
///
/// When `attention_mask` is `None` and `is_causal` is set, a causal mask is
/// synthesised from the query and key lengths; this covers both a fresh
/// prefill and a cache-backed decode where the key sequence is longer than
/// the query sequence.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attention_mask: Option<&Tensor>,
    scale: f64,
    is_causal: bool,
) -> Result<Tensor> {
    let mut attn_weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
    attn_weights = match attention_mask {
        Some(mask) => attn_weights.broadcast_add(mask)?,
        None if is_causal => {
            let seq_len = q.dim(2)?;
            let kv_len = k.dim(2)?;
            let mask =
                create_causal_mask(seq_len, kv_len, attn_weights.dtype(), attn_weights.device())?;
            attn_weights.broadcast_add(&mask)?
        }
        None => attn_weights,
    };
    let attn_weights = ops::softmax_last_dim(&attn_weights.to_dtype(DType::F32)?)?;
    attn_weights.to_dtype(q.dtype())?.matmul(v)
}

/// Causal mask of shape `(1, 1, seq_len, kv_len)` with 0 on visible positions
/// and -inf elsewhere. When `kv_len > seq_len` the queries are assumed to sit
/// at the end of the key sequence, so the first `kv_len - seq_len` keys are
/// visible to every query.
pub fn create_causal_mask(
    seq_len: usize,
    kv_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let offset = kv_len.saturating_sub(seq_len);
    let visible: Vec<u8> = (0..seq_len)
        .flat_map(|row| (0..kv_len).map(move |col| u8::from(col <= row + offset)))
        .collect();
    let visible = Tensor::from_vec(visible, (seq_len, kv_len), device)?;
    let zero = Tensor::zeros((seq_len, kv_len), dtype, device)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (seq_len, kv_len), device)?.to_dtype(dtype)?;
    visible
        .where_cond(&zero, &neg_inf)?
        .reshape((1, 1, seq_len, kv_len))
}

/// Expand grouped key/value heads so each query head sees its own copy.
pub fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
}

/// Swap and negate the two halves of the last dimension:
/// `[x1, x2] -> [-x2, x1]`.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

/// Rotary embedding over several independent position axes, as used by the
/// multimodal decoder where every token carries temporal, height and width
/// coordinates.
#[derive(Debug, Clone)]
pub struct MultiAxisRotaryEmbedding {
    inv_freq: Tensor,
    num_axes: usize,
}

impl MultiAxisRotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64, num_axes: usize, device: &Device) -> Result<Self> {
        if head_dim % 2 != 0 {
            candle_core::bail!("rotary head_dim must be even, got {head_dim}")
        }
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, head_dim / 2, device)?;
        Ok(Self { inv_freq, num_axes })
    }

    /// Compute `(cos, sin)` tables for `positions` of shape
    /// `(num_axes, batch, seq)`. Both outputs are
    /// `(num_axes, batch, seq, head_dim)` in the requested dtype; the
    /// trigonometry itself runs in f32.
    pub fn forward(&self, positions: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (axes, _batch, _seq) = positions.dims3()?;
        if axes != self.num_axes {
            candle_core::bail!("expected {} position axes, got {axes}", self.num_axes)
        }
        let positions = positions.to_dtype(DType::F32)?;
        let half = self.inv_freq.dim(0)?;
        let inv_freq = self.inv_freq.reshape((1, 1, 1, half))?;
        let freqs = positions.unsqueeze(3)?.broadcast_mul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
    }
}

/// Interleave per-axis rotary tables into a single `(batch, 1, seq, head_dim)`
/// tensor. `sections` lists how many frequency pairs each axis owns; the
/// pattern repeats once for the cos half and once for the sin half of the
/// head dimension.
pub fn select_rope_sections(t: &Tensor, sections: &[usize]) -> Result<Tensor> {
    let head_dim = t.dim(D::Minus1)?;
    let section_sum: usize = sections.iter().sum();
    if section_sum * 2 != head_dim {
        candle_core::bail!("rope sections {sections:?} do not cover head_dim {head_dim}")
    }
    let num_axes = t.dim(0)?;
    let mut parts = Vec::with_capacity(sections.len() * 2);
    let mut offset = 0;
    for (idx, &len) in sections.iter().chain(sections.iter()).enumerate() {
        let axis = idx % num_axes;
        parts.push(t.narrow(D::Minus1, offset, len)?.i((axis, .., .., ..))?);
        offset += len;
    }
    Tensor::cat(&parts, D::Minus1)?.unsqueeze(1)
}

/// Flash attention entry point. Inputs are `(batch, seq, heads, head_dim)`.
#[cfg(feature = "flash-attn")]
pub fn flash_attn(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    candle_flash_attn::flash_attn(q, k, v, softmax_scale, causal)
}

#[cfg(not(feature = "flash-attn"))]
pub fn flash_attn(
    _q: &Tensor,
    _k: &Tensor,
    _v: &Tensor,
    _softmax_scale: f32,
    _causal: bool,
) -> Result<Tensor> {
    candle_core::bail!("flash attention requested but the flash-attn feature is not compiled in")
}
