//! Per-token classification head and bilinear upsampling back to pixels.

use candle_core::{Device, Result, Tensor, bail};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::ViTConfig;

/// Projects each token to class scores and restores the input resolution.
pub struct SegmentationHead {
    /// Per-token projection (embed_dim -> num_classes)
    proj: Linear,
    num_classes: usize,
}

impl SegmentationHead {
    /// Create a new segmentation head.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::linear(config.embed_dim, config.num_classes, vb.pp("proj"))?;
        Ok(Self {
            proj,
            num_classes: config.num_classes,
        })
    }

    /// Forward pass through the head.
    ///
    /// # Arguments
    /// * `tokens` - Token tensor of shape (batch, grid_h * grid_w, embed_dim)
    /// * `grid` - Patch grid `(grid_h, grid_w)`
    /// * `size` - Output resolution `(height, width)`
    ///
    /// # Returns
    /// Class scores of shape (batch, num_classes, height, width)
    ///
    /// # Errors
    /// Returns an error if the token count does not match the grid or tensor
    /// operations fail.
    pub fn forward(
        &self,
        tokens: &Tensor,
        grid: (usize, usize),
        size: (usize, usize),
    ) -> Result<Tensor> {
        let (b, n, _d) = tokens.dims3()?;
        let (gh, gw) = grid;
        if n != gh * gw {
            bail!("{n} tokens cannot be laid out on a {gh}x{gw} patch grid");
        }

        // (B, N, K) -> (B, K, gh, gw)
        let scores = self
            .proj
            .forward(tokens)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, self.num_classes, gh, gw))?;

        upsample_bilinear(&scores, size.0, size.1)
    }
}

/// Bilinear resize of a (batch, channels, h, w) tensor with
/// `align_corners = false` semantics.
///
/// Built as two interpolation-matrix products so the op is differentiable
/// with plain matmuls: `out = Rh · x · Rwᵀ`.
///
/// # Errors
/// Returns an error if the input is not rank 4, a spatial size is zero, or
/// tensor operations fail.
pub fn upsample_bilinear(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        bail!("cannot resize {h}x{w} to {out_h}x{out_w}: empty spatial axis");
    }
    if (h, w) == (out_h, out_w) {
        return Ok(x.clone());
    }
    let dtype = x.dtype();
    let device = x.device();

    let rh = interpolation_matrix(h, out_h, device)?.to_dtype(dtype)?;
    let rw_t = interpolation_matrix(w, out_w, device)?
        .to_dtype(dtype)?
        .t()?
        .contiguous()?;

    // (B*C, h, w) @ (w, W) -> (B*C, h, W); (h->H) via (H, h) @ (B*C, h, W)
    let x = x.reshape((b * c, h, w))?;
    let x = x.broadcast_matmul(&rw_t)?;
    let x = rh.broadcast_matmul(&x)?;
    x.reshape((b, c, out_h, out_w))
}

/// Row `i` holds the weights that output position `i` takes from each input
/// position, shape (out_len, in_len).
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn interpolation_matrix(in_len: usize, out_len: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; out_len * in_len];
    let ratio = in_len as f64 / out_len as f64;

    for o in 0..out_len {
        // Half-pixel centers; negative sources clamp to the first pixel.
        let src = ((o as f64 + 0.5) * ratio - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_len - 1);
        let i1 = (i0 + 1).min(in_len - 1);
        let frac = (src - i0 as f64) as f32;
        weights[o * in_len + i0] += 1.0 - frac;
        weights[o * in_len + i1] += frac;
    }

    Tensor::from_vec(weights, (out_len, in_len), device)
}
