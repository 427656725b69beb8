//! Embedding layers for the vision transformer.
//!
//! Patch embedding (strided convolution) and the learned positional
//! embedding.

use candle_core::{Result, Tensor, bail};
use candle_nn::{Conv2d, Conv2dConfig, Init, Module, VarBuilder};

use super::config::ViTConfig;

/// Splits an image into non-overlapping patches and projects each one to a
/// token.
///
/// Equivalent to a convolution with `kernel = stride = patch_size`.
pub struct PatchEmbed {
    /// Strided projection (in_chans -> embed_dim)
    proj: Conv2d,
    /// Patch side length
    patch_size: usize,
}

impl PatchEmbed {
    /// Create a new patch embedding layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv2d(
            config.in_chans,
            config.embed_dim,
            config.patch_size,
            Conv2dConfig {
                stride: config.patch_size,
                ..Default::default()
            },
            vb.pp("proj"),
        )?;
        Ok(Self {
            proj,
            patch_size: config.patch_size,
        })
    }

    /// Forward pass through patch embedding.
    ///
    /// # Arguments
    /// * `x` - Image tensor of shape (batch, in_chans, height, width)
    ///
    /// # Returns
    /// Tokens of shape (batch, (height / p) * (width / p), embed_dim)
    ///
    /// # Errors
    /// Returns an error if height or width is not a multiple of the patch
    /// size, or if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = x.dims4()?;
        let p = self.patch_size;
        if !h.is_multiple_of(p) {
            bail!("image height {h} is not a multiple of patch size {p}");
        }
        if !w.is_multiple_of(p) {
            bail!("image width {w} is not a multiple of patch size {p}");
        }

        // (B, C, H, W) -> (B, D, H/p, W/p)
        let x = self.proj.forward(x)?;
        let (b, d, gh, gw) = x.dims4()?;

        // (B, D, gh*gw) -> (B, gh*gw, D)
        x.reshape((b, d, gh * gw))?.transpose(1, 2)?.contiguous()
    }
}

/// Learned positional embedding, one row per patch.
///
/// Shape (1, num_patches, embed_dim), broadcast over the batch. The row
/// count fixes the input resolution.
pub struct PositionalEmbedding {
    pos_embed: Tensor,
}

impl PositionalEmbedding {
    /// Name of the parameter inside the model's variable tree.
    pub const NAME: &'static str = "pos_embed";

    /// Create a new positional embedding.
    ///
    /// Fresh parameters start at zero; [`crate::model::init::trunc_normal_pos_embed`]
    /// replaces them with a truncated normal draw.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let pos_embed = vb.get_with_hints(
            (1, config.num_patches(), config.embed_dim),
            Self::NAME,
            Init::Const(0.0),
        )?;
        Ok(Self { pos_embed })
    }

    /// Add the positional embedding to a token sequence.
    ///
    /// # Errors
    /// Returns an error if the token count or width does not match.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (_b, n, d) = tokens.dims3()?;
        let (_, expected_n, expected_d) = self.pos_embed.dims3()?;
        if n != expected_n || d != expected_d {
            bail!(
                "token sequence ({n}, {d}) does not match positional embedding ({expected_n}, {expected_d})"
            );
        }
        tokens.broadcast_add(&self.pos_embed)
    }

    /// The raw embedding parameter.
    #[must_use]
    pub fn weights(&self) -> &Tensor {
        &self.pos_embed
    }
}
