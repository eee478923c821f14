//! Vision tower: patch embedding, windowed-attention transformer blocks and
//! the patch merger that projects merged cells into the decoder width.
//!
//! Most blocks attend within square pixel windows; the blocks listed in
//! `fullatt_block_indexes` attend over the whole image. Patches arrive in
//! merge-block order and are permuted into window order up front, then the
//! merger output is permuted back so rows line up with the decoder's token
//! order.

use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{linear, ops, rms_norm, Linear, Module, RmsNorm, VarBuilder};

use super::attention::{rotate_half, scaled_dot_product_attention};
use super::config::VisionConfig;

const NORM_EPS: f64 = 1e-6;

#[derive(Debug, Clone)]
struct VisionRotaryEmbedding {
    inv_freq: Tensor,
}

impl VisionRotaryEmbedding {
    fn new(dim: usize, theta: f64, device: &candle_core::Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, len, device)?;
        Ok(Self { inv_freq })
    }

    /// Outer product of `0..seqlen` and the inverse frequencies,
    /// `(seqlen, dim / 2)`.
    fn forward(&self, seqlen: usize) -> Result<Tensor> {
        let positions = Tensor::arange(0u32, seqlen as u32, self.inv_freq.device())?
            .to_dtype(DType::F32)?;
        positions.unsqueeze(1)?.matmul(&self.inv_freq.unsqueeze(0)?)
    }
}

struct PatchEmbed {
    weight: Tensor,
}

impl PatchEmbed {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let patch_dim =
            cfg.in_channels * cfg.temporal_patch_size * cfg.patch_size * cfg.patch_size;
        // Checkpoints store the projection as a conv3d kernel; flatten it
        // into a plain matmul weight.
        let weight = match vb.get((cfg.hidden_size, patch_dim), "proj.weight") {
            Ok(w) => w,
            Err(_) => vb
                .get(
                    (
                        cfg.hidden_size,
                        cfg.in_channels,
                        cfg.temporal_patch_size,
                        cfg.patch_size,
                        cfg.patch_size,
                    ),
                    "proj.weight",
                )?
                .reshape((cfg.hidden_size, patch_dim))?,
        };
        Ok(Self { weight })
    }

    fn forward(&self, patches: &Tensor) -> Result<Tensor> {
        patches
            .to_dtype(self.weight.dtype())?
            .matmul(&self.weight.t()?)
    }
}

fn apply_rotary_pos_emb_vision(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let in_dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let cos = cos.unsqueeze(1)?;
    let sin = sin.unsqueeze(1)?;
    let q_embed = q.broadcast_mul(&cos)?.add(&rotate_half(&q)?.broadcast_mul(&sin)?)?;
    let k_embed = k.broadcast_mul(&cos)?.add(&rotate_half(&k)?.broadcast_mul(&sin)?)?;
    Ok((q_embed.to_dtype(in_dtype)?, k_embed.to_dtype(in_dtype)?))
}

struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(cfg: &VisionConfig, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            qkv: linear(cfg.hidden_size, cfg.hidden_size * 3, vb.pp("qkv"))?,
            proj: linear(cfg.hidden_size, cfg.hidden_size, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `cu_seqlens` holds cumulative patch offsets; attention runs
    /// independently inside each `[cu[i], cu[i+1])` span.
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cu_seqlens: &[usize],
    ) -> Result<Tensor> {
        let seq_len = x.dim(0)?;
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((seq_len, 3, self.num_heads, self.head_dim))?;
        let q = qkv.i((.., 0, .., ..))?;
        let k = qkv.i((.., 1, .., ..))?;
        let v = qkv.i((.., 2, .., ..))?;
        let (q, k) = apply_rotary_pos_emb_vision(&q, &k, cos, sin)?;
        let q = q.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let k = k.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let v = v.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;

        let mut segments = Vec::with_capacity(cu_seqlens.len().saturating_sub(1));
        for bounds in cu_seqlens.windows(2) {
            let (start, end) = (bounds[0], bounds[1]);
            if end <= start {
                continue;
            }
            let q_seg = q.narrow(2, start, end - start)?;
            let k_seg = k.narrow(2, start, end - start)?;
            let v_seg = v.narrow(2, start, end - start)?;
            segments.push(scaled_dot_product_attention(
                &q_seg, &k_seg, &v_seg, None, self.scale, false,
            )?);
        }
        let attn = Tensor::cat(&segments, 2)?;
        let attn = attn
            .squeeze(0)?
            .transpose(0, 1)?
            .reshape((seq_len, self.num_heads * self.head_dim))?;
        self.proj.forward(&attn)
    }
}

struct VisionMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl VisionMlp {
    fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear(dim, hidden_dim, vb.pp("gate_proj"))?,
            up_proj: linear(dim, hidden_dim, vb.pp("up_proj"))?,
            down_proj: linear(hidden_dim, dim, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = ops::silu(&self.gate_proj.forward(x)?)?;
        self.down_proj.forward(&(gate * self.up_proj.forward(x)?)?)
    }
}

struct VisionBlock {
    norm1: RmsNorm,
    norm2: RmsNorm,
    attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn new(cfg: &VisionConfig, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: rms_norm(cfg.hidden_size, NORM_EPS, vb.pp("norm1"))?,
            norm2: rms_norm(cfg.hidden_size, NORM_EPS, vb.pp("norm2"))?,
            attn: VisionAttention::new(cfg, head_dim, vb.pp("attn"))?,
            mlp: VisionMlp::new(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cu_seqlens: &[usize],
    ) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.norm1.forward(x)?, cos, sin, cu_seqlens)?)?;
        let out = (&x + self.mlp.forward(&self.norm2.forward(&x)?)?)?;
        Ok(out)
    }
}

struct PatchMerger {
    ln_q: RmsNorm,
    mlp_fc1: Linear,
    mlp_fc2: Linear,
    group: usize,
    hidden: usize,
}

impl PatchMerger {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let group = cfg.spatial_merge_size * cfg.spatial_merge_size;
        let hidden = cfg.hidden_size * group;
        Ok(Self {
            ln_q: rms_norm(cfg.hidden_size, NORM_EPS, vb.pp("ln_q"))?,
            mlp_fc1: linear(hidden, hidden, vb.pp("mlp.0"))?,
            mlp_fc2: linear(hidden, cfg.out_hidden_size, vb.pp("mlp.2"))?,
            group,
            hidden,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(0)?;
        let x = self
            .ln_q
            .forward(x)?
            .reshape((seq_len / self.group, self.hidden))?;
        let x = self.mlp_fc1.forward(&x)?.gelu_erf()?;
        self.mlp_fc2.forward(&x)
    }
}

/// Window layout for one image grid: the permutation of merged-cell indices
/// that groups cells into windows, plus cumulative patch offsets of the
/// window boundaries in the permuted sequence. Windows that fall entirely in
/// the padded border contribute no cells and no boundary.
fn get_window_index(
    grid_thw: (usize, usize, usize),
    merge_size: usize,
    window_cells: usize,
) -> (Vec<u32>, Vec<usize>) {
    let (grid_t, grid_h, grid_w) = grid_thw;
    let llm_h = grid_h / merge_size;
    let llm_w = grid_w / merge_size;
    let merge_unit = merge_size * merge_size;
    let pad_h = window_cells - llm_h % window_cells;
    let pad_w = window_cells - llm_w % window_cells;
    let num_windows_h = (llm_h + pad_h) / window_cells;
    let num_windows_w = (llm_w + pad_w) / window_cells;

    let mut window_index = Vec::with_capacity(grid_t * llm_h * llm_w);
    let mut cu_seqlens = vec![0usize];
    for tt in 0..grid_t {
        for wh in 0..num_windows_h {
            for ww in 0..num_windows_w {
                let mut cells_in_window = 0;
                for inner_h in 0..window_cells {
                    for inner_w in 0..window_cells {
                        let row = wh * window_cells + inner_h;
                        let col = ww * window_cells + inner_w;
                        if row < llm_h && col < llm_w {
                            window_index.push(((tt * llm_h + row) * llm_w + col) as u32);
                            cells_in_window += 1;
                        }
                    }
                }
                let last = cu_seqlens.last().copied().unwrap_or(0);
                let next = last + cells_in_window * merge_unit;
                if next != last {
                    cu_seqlens.push(next);
                }
            }
        }
    }
    (window_index, cu_seqlens)
}

pub struct VisionModel {
    patch_embed: PatchEmbed,
    rotary: VisionRotaryEmbedding,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    spatial_merge_size: usize,
    window_cells: usize,
    fullatt_block_indexes: Vec<usize>,
}

impl VisionModel {
    pub fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.hidden_size % cfg.num_heads != 0 {
            candle_core::bail!(
                "vision hidden_size {} not divisible by num_heads {}",
                cfg.hidden_size,
                cfg.num_heads
            )
        }
        let head_dim = cfg.hidden_size / cfg.num_heads;
        let rotary = VisionRotaryEmbedding::new(head_dim / 2, 10000.0, vb.device())?;
        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let mut blocks = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            blocks.push(VisionBlock::new(cfg, head_dim, vb.pp(format!("blocks.{i}")))?);
        }
        let merger = PatchMerger::new(cfg, vb.pp("merger"))?;
        Ok(Self {
            patch_embed,
            rotary,
            blocks,
            merger,
            spatial_merge_size: cfg.spatial_merge_size,
            window_cells: cfg.merger_window_size(),
            fullatt_block_indexes: cfg.fullatt_block_indexes.clone(),
        })
    }

    /// Per-patch rotary table in merge-block order, `(seq, head_dim / 2)`.
    /// The first half encodes row positions, the second half columns.
    fn rot_pos_emb(&self, grid_thw: (usize, usize, usize)) -> Result<Tensor> {
        let (grid_t, grid_h, grid_w) = grid_thw;
        let merge = self.spatial_merge_size;
        let seq_len = grid_t * grid_h * grid_w;
        let mut hpos = Vec::with_capacity(seq_len);
        let mut wpos = Vec::with_capacity(seq_len);
        for _tt in 0..grid_t {
            for hb in 0..grid_h / merge {
                for wb in 0..grid_w / merge {
                    for h_inner in 0..merge {
                        for w_inner in 0..merge {
                            hpos.push((hb * merge + h_inner) as u32);
                            wpos.push((wb * merge + w_inner) as u32);
                        }
                    }
                }
            }
        }
        let table = self.rotary.forward(grid_h.max(grid_w))?;
        let device = table.device();
        let hpos = Tensor::from_vec(hpos, seq_len, device)?;
        let wpos = Tensor::from_vec(wpos, seq_len, device)?;
        let freqs_h = table.index_select(&hpos, 0)?;
        let freqs_w = table.index_select(&wpos, 0)?;
        Tensor::cat(&[&freqs_h, &freqs_w], D::Minus1)
    }

    /// Encode one image's patches into `(merged_cells, out_hidden_size)`
    /// embeddings, ordered to match the placeholder tokens in the prompt.
    pub fn forward(
        &self,
        pixel_values: &Tensor,
        grid_thw: (usize, usize, usize),
    ) -> Result<Tensor> {
        let (grid_t, grid_h, grid_w) = grid_thw;
        let seq_len = grid_t * grid_h * grid_w;
        let merge_unit = self.spatial_merge_size * self.spatial_merge_size;

        let mut hidden = self.patch_embed.forward(pixel_values)?;
        if hidden.dim(0)? != seq_len {
            candle_core::bail!(
                "patch count {} does not match grid {grid_thw:?}",
                hidden.dim(0)?
            )
        }
        let rot = self.rot_pos_emb(grid_thw)?;

        let (window_index, cu_window_seqlens) =
            get_window_index(grid_thw, self.spatial_merge_size, self.window_cells);
        let index = Tensor::from_vec(window_index.clone(), window_index.len(), hidden.device())?;
        let embed_dim = hidden.dim(1)?;
        hidden = hidden
            .reshape((seq_len / merge_unit, merge_unit, embed_dim))?
            .index_select(&index, 0)?
            .reshape((seq_len, embed_dim))?;
        let rot_dim = rot.dim(1)?;
        let rot = rot
            .reshape((seq_len / merge_unit, merge_unit, rot_dim))?
            .index_select(&index, 0)?
            .reshape((seq_len, rot_dim))?;
        let emb = Tensor::cat(&[&rot, &rot], D::Minus1)?;
        let cos = emb.cos()?;
        let sin = emb.sin()?;

        let mut cu_full = vec![0usize];
        for _ in 0..grid_t {
            let last = cu_full.last().copied().unwrap_or(0);
            cu_full.push(last + grid_h * grid_w);
        }

        for (idx, block) in self.blocks.iter().enumerate() {
            let cu = if self.fullatt_block_indexes.contains(&idx) {
                &cu_full
            } else {
                &cu_window_seqlens
            };
            hidden = block.forward(&hidden, &cos, &sin, cu)?;
        }

        let merged = self.merger.forward(&hidden)?;

        // Undo the window permutation.
        let mut inverse = vec![0u32; window_index.len()];
        for (dst, &src) in window_index.iter().enumerate() {
            inverse[src as usize] = dst as u32;
        }
        let inverse = Tensor::from_vec(inverse, window_index.len(), merged.device())?;
        merged.index_select(&inverse, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn window_index_is_identity_for_single_window() {
        // 8x8 patch grid with merge 2 is a 4x4 cell grid, exactly one window.
        let (index, cu) = get_window_index((1, 8, 8), 2, 4);
        assert_eq!(index, (0..16).collect::<Vec<u32>>());
        assert_eq!(cu, vec![0, 64]);
    }

    #[test]
    fn window_index_groups_cells_by_window() {
        // 4x8 cell grid splits into two 4x4 windows side by side.
        let (index, cu) = get_window_index((1, 8, 16), 2, 4);
        assert_eq!(index.len(), 32);
        assert_eq!(cu, vec![0, 64, 128]);
        // First window walks rows of the left half.
        assert_eq!(&index[..8], &[0, 1, 2, 3, 8, 9, 10, 11]);
        // Second window starts at the right half's first column.
        assert_eq!(index[16], 4);
    }

    #[test]
    fn window_index_handles_partial_windows() {
        // 2x3 cell grid fits inside one padded window; order is unchanged
        // and padded slots contribute nothing.
        let (index, cu) = get_window_index((1, 4, 6), 2, 4);
        assert_eq!(index, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(cu, vec![0, 24]);
    }

    #[test]
    fn rotary_table_shape() {
        let rope = VisionRotaryEmbedding::new(40, 10000.0, &Device::Cpu).unwrap();
        let table = rope.forward(6).unwrap();
        assert_eq!(table.dims(), &[6, 20]);
    }

    #[test]
    fn forward_shapes_with_zero_weights() {
        let cfg = VisionConfig {
            depth: 2,
            hidden_size: 32,
            intermediate_size: 64,
            out_hidden_size: 48,
            hidden_act: "silu".to_string(),
            num_heads: 4,
            in_channels: 3,
            patch_size: 2,
            spatial_merge_size: 2,
            temporal_patch_size: 2,
            window_size: 8,
            fullatt_block_indexes: vec![1],
        };
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = VisionModel::new(&cfg, vb).unwrap();
        let patch_dim = 3 * 2 * 2 * 2;
        let pixels = Tensor::zeros((16, patch_dim), DType::F32, &device).unwrap();
        let out = model.forward(&pixels, (1, 4, 4)).unwrap();
        assert_eq!(out.dims(), &[4, cfg.out_hidden_size]);
    }
}
