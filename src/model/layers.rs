//! MLP and pre-norm transformer block.

use candle_core::{D, Result, Tensor};
use candle_nn::{Dropout, Init, Linear, Module, VarBuilder};

use super::attention::SelfAttention;
use super::config::ViTConfig;
use super::mode::Mode;

/// Feed-forward network with GELU activation.
///
/// fc1 -> GELU -> dropout -> fc2 -> dropout, applied to every token
/// independently.
pub struct Mlp {
    /// Up projection (embed_dim -> hidden)
    fc1: Linear,
    /// Down projection (hidden -> embed_dim)
    fc2: Linear,
    drop: Dropout,
}

impl Mlp {
    /// Create a new MLP layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.embed_dim;
        let hidden = config.mlp_hidden();

        let fc1 = candle_nn::linear(dim, hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden, dim, vb.pp("fc2"))?;

        Ok(Self {
            fc1,
            fc2,
            drop: Dropout::new(config.proj_drop),
        })
    }

    /// Forward pass through the MLP.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, num_patches, embed_dim)
    /// * `mode` - Training or evaluation
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let train = mode.is_train();
        // Exact erf GELU
        let h = self.fc1.forward(x)?.gelu_erf()?;
        let h = self.drop.forward(&h, train)?;
        let h = self.fc2.forward(&h)?;
        self.drop.forward(&h, train)
    }
}

/// Layer normalization over the last axis, written with differentiable
/// primitives.
///
/// candle's fused layer-norm kernel records no backward op, which would cut
/// the gradient at every block during training.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a new layer norm with learned scale and shift.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// Normalize `x` over its last axis.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Transformer block with pre-norm architecture.
///
/// Structure: LayerNorm -> Attention -> Residual -> LayerNorm -> MLP -> Residual
pub struct TransformerBlock {
    /// Layer norm before attention
    norm1: LayerNorm,
    attn: SelfAttention,
    /// Layer norm before the MLP
    norm2: LayerNorm,
    mlp: Mlp,
}

impl TransformerBlock {
    /// Create a new transformer block.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.embed_dim;

        let norm1 = LayerNorm::new(dim, 1e-5, vb.pp("norm1"))?;
        let attn = SelfAttention::new(config, vb.pp("attn"))?;
        let norm2 = LayerNorm::new(dim, 1e-5, vb.pp("norm2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;

        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }

    /// Forward pass through the block.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, num_patches, embed_dim)
    /// * `mode` - Training or evaluation
    ///
    /// # Returns
    /// Output tensor of the same shape
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let h = self.attn.forward(&self.norm1.forward(x)?, mode)?;
        let x = (x + h)?;

        let h = self.mlp.forward(&self.norm2.forward(&x)?, mode)?;
        x + h
    }
}
