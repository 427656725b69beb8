//! Multi-head self-attention over patch tokens.
//!
//! Every token attends to every other token; there is no causal mask.

use candle_core::{D, Result, Tensor, bail};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use super::config::ViTConfig;
use super::mode::Mode;

/// Multi-head self-attention.
///
/// Uses a single fused QKV projection.
pub struct SelfAttention {
    /// Combined query, key, value projection (dim -> 3 * dim)
    qkv: Linear,
    /// Output projection (dim -> dim)
    proj: Linear,
    /// Dropout on attention weights
    attn_drop: Dropout,
    /// Dropout after the output projection
    proj_drop: Dropout,
    /// Number of attention heads
    num_heads: usize,
    /// Embedding dimension
    dim: usize,
    /// Dimension per head
    head_dim: usize,
    /// Multiplier applied to Q·Kᵀ
    scale: f64,
}

impl SelfAttention {
    /// Create a new self-attention layer.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if `embed_dim` is not divisible by `num_heads` or
    /// weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.embed_dim;
        let num_heads = config.num_heads;
        if num_heads == 0 || !dim.is_multiple_of(num_heads) {
            bail!("attention dim {dim} is not divisible by num_heads {num_heads}");
        }

        let qkv = candle_nn::linear_b(dim, 3 * dim, config.qkv_bias, vb.pp("qkv"))?;
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;

        Ok(Self {
            qkv,
            proj,
            attn_drop: Dropout::new(config.attn_drop),
            proj_drop: Dropout::new(config.proj_drop),
            num_heads,
            dim,
            head_dim: dim / num_heads,
            scale: config.attn_scale(),
        })
    }

    /// Forward pass for self-attention.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, num_patches, dim)
    /// * `mode` - Training or evaluation; dropout is identity in evaluation
    ///
    /// # Returns
    /// Output tensor of shape (batch, num_patches, dim)
    ///
    /// # Errors
    /// Returns an error if the input width differs from the layer width or
    /// tensor operations fail.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let (b, n, _c) = x.dims3()?;
        let (att, v) = self.weights_and_values(x)?;
        let att = self.attn_drop.forward(&att, mode.is_train())?;

        // (B, H, N, N) @ (B, H, N, hd) -> (B, N, C)
        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, self.dim))?;

        let y = self.proj.forward(&y)?;
        self.proj_drop.forward(&y, mode.is_train())
    }

    /// Attention weights for inspection, shape (batch, heads, N, N).
    ///
    /// # Errors
    /// Returns an error if the input width differs from the layer width or
    /// tensor operations fail.
    pub fn attention_weights(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.weights_and_values(x)?.0)
    }

    /// Split the fused projection into heads and return
    /// `(softmax(Q·Kᵀ · scale), V)`, shapes (B, H, N, N) and (B, H, N, hd).
    fn weights_and_values(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, n, c) = x.dims3()?;
        if c != self.dim {
            bail!("attention expects width {}, got {c}", self.dim);
        }

        // (B, N, C) -> (B, N, 3, H, hd) -> (3, B, H, N, hd)
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k_t = qkv.get(1)?.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        // Softmax over the key axis
        let att = (q.matmul(&k_t)? * self.scale)?;
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        Ok((att, v))
    }
}
