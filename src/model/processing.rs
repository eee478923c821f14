//! Image-to-patch preprocessing and prompt assembly.
//!
//! Images are resized so both sides are multiples of `patch_size * merge_size`,
//! normalised, and cut into flattened patches in the merge-block order the
//! vision tower expects. The companion prompt helpers render the chat template
//! and expand the single image placeholder token to one token per merged patch.

use candle_core::{DType, Device, Result, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use super::config::PreprocessorConfig;

/// Pixel patches and grid layout for a single preprocessed image.
#[derive(Debug)]
pub struct ImageInputs {
    /// `(grid_t * grid_h * grid_w, channels * temporal_patch_size * patch_size^2)`
    pub pixel_values: Tensor,
    /// `(grid_t, grid_h, grid_w)` in units of `patch_size`.
    pub grid_thw: (usize, usize, usize),
}

impl ImageInputs {
    /// Number of positions the image occupies in the token sequence after
    /// spatial merging.
    pub fn token_count(&self, merge_size: usize) -> usize {
        let (t, h, w) = self.grid_thw;
        t * h * w / (merge_size * merge_size)
    }
}

/// Pick output dimensions that are multiples of `factor` while keeping the
/// pixel count within `[min_pixels, max_pixels]` and the aspect ratio close
/// to the original.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    if height == 0 || width == 0 {
        candle_core::bail!("cannot resize an empty {width}x{height} image")
    }
    let (h, w) = (height as f64, width as f64);
    let aspect = h.max(w) / h.min(w);
    if aspect > 200.0 {
        candle_core::bail!(
            "aspect ratio {aspect:.1} of {width}x{height} image exceeds the supported maximum of 200"
        )
    }
    let f = factor as f64;
    let mut h_bar = (h / f).round() * f;
    let mut w_bar = (w / f).round() * f;
    if h_bar * w_bar > max_pixels as f64 {
        let beta = ((h * w) / max_pixels as f64).sqrt();
        h_bar = (h / beta / f).floor() * f;
        w_bar = (w / beta / f).floor() * f;
    } else if h_bar * w_bar < min_pixels as f64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = (h * beta / f).ceil() * f;
        w_bar = (w * beta / f).ceil() * f;
    }
    Ok((h_bar.max(f) as u32, w_bar.max(f) as u32))
}

/// Map a PIL resampling constant onto the closest `image` filter.
pub fn resample_filter(resample: Option<u32>) -> FilterType {
    match resample {
        Some(0) => FilterType::Nearest,
        Some(1) => FilterType::Lanczos3,
        Some(2) | Some(4) => FilterType::Triangle,
        _ => FilterType::CatmullRom,
    }
}

/// Rescale and normalise an RGB image into planar CHW f32 layout.
fn image_to_chw(img: &RgbImage, mean: &[f32], std: &[f32], rescale: f32) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let area = width as usize * height as usize;
    let mut chw = vec![0.0f32; 3 * area];
    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        for c in 0..3 {
            let m = mean.get(c).copied().unwrap_or(0.0);
            let s = std.get(c).copied().unwrap_or(1.0);
            chw[c * area + idx] = (pixel[c] as f32 * rescale - m) / s;
        }
    }
    chw
}

/// Resize, normalise and patchify a single image.
///
/// Patches are emitted in merge-block order: for each `merge_size` x
/// `merge_size` block of patches, the block's patches appear consecutively.
/// Within a patch the layout is channel-major, then temporal, then rows.
pub fn preprocess(
    image: &DynamicImage,
    cfg: &PreprocessorConfig,
    device: &Device,
    dtype: DType,
) -> Result<ImageInputs> {
    let factor = (cfg.patch_size * cfg.merge_size) as u32;
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let (target_h, target_w) = if cfg.do_resize {
        let (min_pixels, max_pixels) = match cfg.pixel_bounds() {
            Ok(bounds) => bounds,
            Err(e) => candle_core::bail!("{e}"),
        };
        smart_resize(height, width, factor, min_pixels, max_pixels)?
    } else if height % factor == 0 && width % factor == 0 {
        (height, width)
    } else {
        candle_core::bail!(
            "image dimensions {width}x{height} are not multiples of {factor} and resizing is disabled"
        )
    };
    let resized = if (target_h, target_w) != (height, width) {
        image::imageops::resize(&rgb, target_w, target_h, resample_filter(cfg.resample))
    } else {
        rgb
    };

    let (mean, std): (&[f32], &[f32]) = if cfg.do_normalize {
        (&cfg.image_mean, &cfg.image_std)
    } else {
        (&[], &[])
    };
    let rescale = if cfg.do_rescale { cfg.rescale_factor } else { 1.0 };
    let chw = image_to_chw(&resized, mean, std, rescale);

    let patch = cfg.patch_size;
    let merge = cfg.merge_size;
    let temporal = cfg.temporal_patch_size;
    let width = target_w as usize;
    let frame_area = width * target_h as usize;
    let grid_t = 1;
    let grid_h = target_h as usize / patch;
    let grid_w = target_w as usize / patch;
    let patch_dim = 3 * temporal * patch * patch;
    let total = grid_t * grid_h * grid_w;

    // A still image is replicated across the temporal axis, so every temporal
    // slot reads from the same frame.
    let mut data = Vec::with_capacity(total * patch_dim);
    for _tt in 0..grid_t {
        for hb in 0..grid_h / merge {
            for wb in 0..grid_w / merge {
                for h_inner in 0..merge {
                    for w_inner in 0..merge {
                        for c in 0..3 {
                            for _t_inner in 0..temporal {
                                let base_y = (hb * merge + h_inner) * patch;
                                let base_x = (wb * merge + w_inner) * patch;
                                for dy in 0..patch {
                                    let row = c * frame_area + (base_y + dy) * width + base_x;
                                    data.extend_from_slice(&chw[row..row + patch]);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let pixel_values = Tensor::from_vec(data, (total, patch_dim), device)?.to_dtype(dtype)?;
    Ok(ImageInputs {
        pixel_values,
        grid_thw: (grid_t, grid_h, grid_w),
    })
}

/// Render the chat template for a single-image request, ending with the open
/// assistant turn so generation continues from there.
pub fn build_prompt(system_prompt: &str, instruction: &str) -> String {
    format!(
        "<|im_start|>system\n{system_prompt}<|im_end|>\n\
         <|im_start|>user\n<|vision_start|><|image_pad|><|vision_end|>{instruction}<|im_end|>\n\
         <|im_start|>assistant\n"
    )
}

/// Replace each image placeholder token with `count` copies, one per merged
/// patch position.
pub fn expand_image_tokens(tokens: &[u32], image_token_id: u32, count: usize) -> Vec<u32> {
    let mut out = Vec::with_capacity(tokens.len() + count.saturating_sub(1));
    for &token in tokens {
        if token == image_token_id {
            out.extend(std::iter::repeat(image_token_id).take(count));
        } else {
            out.push(token);
        }
    }
    out
}
