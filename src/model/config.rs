use candle_core::{Result, bail};
use serde::{Deserialize, Serialize};

/// How the transformer blocks are wired between the embedding and the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// `depth` blocks chained one after another.
    #[default]
    Sequential,
    /// `depth` down blocks all fed the embedded input, followed by `depth` up
    /// blocks that add the down outputs back in reverse order.
    EncoderDecoder,
}

/// Vision transformer hyperparameters.
///
/// The input resolution is part of the config because the learned positional
/// embedding has one row per patch and is never resized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViTConfig {
    /// Input image height in pixels
    pub img_height: usize,
    /// Input image width in pixels
    pub img_width: usize,
    /// Side length of the square patches
    pub patch_size: usize,
    /// Input channels (3 for RGB)
    pub in_chans: usize,
    /// Number of segmentation classes (19 Cityscapes train ids)
    pub num_classes: usize,
    /// Token embedding dimension
    pub embed_dim: usize,
    /// Number of blocks (sequential) or down/up stage pairs (encoder-decoder)
    pub depth: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// MLP hidden width as a multiple of `embed_dim`
    pub mlp_ratio: f64,
    /// Whether the fused QKV projection has a bias
    pub qkv_bias: bool,
    /// Explicit attention scale; `None` means `1 / sqrt(head_dim)`
    #[serde(default)]
    pub qk_scale: Option<f64>,
    /// Dropout probability on attention weights
    #[serde(default)]
    pub attn_drop: f32,
    /// Dropout probability after projections and inside the MLP
    #[serde(default)]
    pub proj_drop: f32,
    /// Block wiring
    #[serde(default)]
    pub topology: Topology,
}

impl ViTConfig {
    /// Dimension per attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Patch grid as `(rows, cols)`.
    #[must_use]
    pub fn grid(&self) -> (usize, usize) {
        (
            self.img_height / self.patch_size,
            self.img_width / self.patch_size,
        )
    }

    /// Number of tokens produced by the patch embedding.
    #[must_use]
    pub fn num_patches(&self) -> usize {
        let (rows, cols) = self.grid();
        rows * cols
    }

    /// Hidden width of the MLP.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn mlp_hidden(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Attention score scale.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn attn_scale(&self) -> f64 {
        self.qk_scale
            .unwrap_or_else(|| 1.0 / (self.head_dim() as f64).sqrt())
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns an error naming the offending dimensions if the configuration
    /// is internally inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            bail!("patch_size must be positive");
        }
        if self.img_height == 0 || self.img_width == 0 {
            bail!(
                "image size must be positive, got {}x{}",
                self.img_height,
                self.img_width
            );
        }
        if !self.img_height.is_multiple_of(self.patch_size)
            || !self.img_width.is_multiple_of(self.patch_size)
        {
            bail!(
                "image size {}x{} is not divisible by patch_size {}",
                self.img_height,
                self.img_width,
                self.patch_size
            );
        }
        if self.num_heads == 0 || !self.embed_dim.is_multiple_of(self.num_heads) {
            bail!(
                "embed_dim {} must be divisible by num_heads {}",
                self.embed_dim,
                self.num_heads
            );
        }
        if self.in_chans == 0 || self.num_classes == 0 {
            bail!("in_chans and num_classes must be positive");
        }
        if self.depth == 0 {
            bail!("depth must be positive");
        }
        if self.mlp_hidden() == 0 {
            bail!("mlp_ratio {} gives an empty MLP", self.mlp_ratio);
        }
        for (name, p) in [("attn_drop", self.attn_drop), ("proj_drop", self.proj_drop)] {
            if !(0.0..1.0).contains(&p) {
                bail!("{name} must be in [0, 1), got {p}");
            }
        }
        Ok(())
    }

    /// Tiny config for tests and smoke runs.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            img_height: 32,
            img_width: 32,
            patch_size: 8,
            in_chans: 3,
            num_classes: 19,
            embed_dim: 32,
            depth: 2,
            num_heads: 4,
            mlp_ratio: 4.0,
            qkv_bias: false,
            qk_scale: None,
            attn_drop: 0.0,
            proj_drop: 0.0,
            topology: Topology::Sequential,
        }
    }

    /// Small config for quick experiments on downscaled crops.
    #[must_use]
    pub fn small() -> Self {
        Self {
            img_height: 128,
            img_width: 256,
            patch_size: 16,
            embed_dim: 192,
            depth: 6,
            num_heads: 3,
            proj_drop: 0.1,
            ..Self::tiny()
        }
    }

    /// Base config: 768-dim, 12 blocks, 8 heads on 256x256 crops.
    #[must_use]
    pub fn base() -> Self {
        Self {
            img_height: 256,
            img_width: 256,
            patch_size: 16,
            embed_dim: 768,
            depth: 12,
            num_heads: 8,
            proj_drop: 0.0,
            ..Self::tiny()
        }
    }
}

impl Default for ViTConfig {
    fn default() -> Self {
        Self::base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for cfg in [ViTConfig::tiny(), ViTConfig::small(), ViTConfig::base()] {
            assert!(cfg.validate().is_ok(), "{cfg:?}");
        }
    }

    #[test]
    fn test_derived_sizes() {
        let cfg = ViTConfig::base();
        assert_eq!(cfg.head_dim(), 96);
        assert_eq!(cfg.grid(), (16, 16));
        assert_eq!(cfg.num_patches(), 256);
        assert_eq!(cfg.mlp_hidden(), 3072);
        assert!((cfg.attn_scale() - 1.0 / 96f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_explicit_scale_wins() {
        let cfg = ViTConfig {
            qk_scale: Some(0.5),
            ..ViTConfig::tiny()
        };
        assert!((cfg.attn_scale() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let cfg = ViTConfig {
            embed_dim: 30,
            num_heads: 4,
            ..ViTConfig::tiny()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("divisible by num_heads"), "{err}");
    }

    #[test]
    fn test_rejects_indivisible_patches() {
        let cfg = ViTConfig {
            img_width: 36,
            ..ViTConfig::tiny()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("patch_size"), "{err}");
    }

    #[test]
    fn test_rejects_bad_dropout() {
        let cfg = ViTConfig {
            attn_drop: 1.0,
            ..ViTConfig::tiny()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_defaults_optional_fields() {
        let json = r#"{
            "img_height": 64, "img_width": 64, "patch_size": 16, "in_chans": 3,
            "num_classes": 19, "embed_dim": 64, "depth": 2, "num_heads": 4,
            "mlp_ratio": 4.0, "qkv_bias": true
        }"#;
        let cfg: ViTConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.topology, Topology::Sequential);
        assert!(cfg.qk_scale.is_none());
        assert!(cfg.validate().is_ok());

        let json = json.replace(
            "\"qkv_bias\": true",
            "\"qkv_bias\": true, \"topology\": \"encoder_decoder\"",
        );
        let cfg: ViTConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.topology, Topology::EncoderDecoder);
    }
}
