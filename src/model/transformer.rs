//! Vision transformer for semantic segmentation.
//!
//! Image -> patch tokens -> positional embedding -> transformer blocks ->
//! per-token class scores -> bilinear upsampling to the input resolution.

use candle_core::{DType, Device, Result, Tensor, bail};
use candle_nn::{VarBuilder, VarMap};

use super::config::{Topology, ViTConfig};
use super::embedding::{PatchEmbed, PositionalEmbedding};
use super::head::SegmentationHead;
use super::init::trunc_normal_pos_embed;
use super::layers::TransformerBlock;
use super::mode::Mode;

/// Block wiring between the embedding and the head.
enum Blocks {
    /// Blocks applied one after another.
    Sequential(Vec<TransformerBlock>),
    /// Parallel down blocks over the same input and a decode path that adds
    /// their outputs back in reverse order.
    EncoderDecoder {
        down: Vec<TransformerBlock>,
        up: Vec<TransformerBlock>,
    },
}

/// Segmentation vision transformer.
pub struct SegViT {
    patch_embed: PatchEmbed,
    pos_embed: PositionalEmbedding,
    blocks: Blocks,
    head: SegmentationHead,
    config: ViTConfig,
    device: Device,
}

impl SegViT {
    /// Create a model, loading or creating weights through `vb`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or weight loading
    /// fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: ViTConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();

        let patch_embed = PatchEmbed::new(&config, vb.pp("patch_embed"))?;
        let pos_embed = PositionalEmbedding::new(&config, vb.clone())?;

        let stack = |prefix: &str| -> Result<Vec<TransformerBlock>> {
            (0..config.depth)
                .map(|i| TransformerBlock::new(&config, vb.pp(format!("{prefix}.{i}"))))
                .collect()
        };
        let blocks = match config.topology {
            Topology::Sequential => Blocks::Sequential(stack("blocks")?),
            Topology::EncoderDecoder => Blocks::EncoderDecoder {
                down: stack("down_blocks")?,
                up: stack("up_blocks")?,
            },
        };

        let head = SegmentationHead::new(&config, vb.pp("segmentation_head"))?;

        tracing::debug!(
            topology = ?config.topology,
            depth = config.depth,
            embed_dim = config.embed_dim,
            num_heads = config.num_heads,
            num_patches = config.num_patches(),
            "built SegViT"
        );

        Ok(Self {
            patch_embed,
            pos_embed,
            blocks,
            head,
            config,
            device,
        })
    }

    /// Build a freshly initialized, trainable model whose parameters live in
    /// `varmap`.
    ///
    /// Linear and conv weights use candle's default initializers; the
    /// positional embedding gets a truncated normal draw seeded by `seed`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or initialization
    /// fails.
    pub fn init(config: ViTConfig, varmap: &VarMap, device: &Device, seed: u64) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        trunc_normal_pos_embed(varmap, seed)?;
        Ok(model)
    }

    /// Forward pass through the model.
    ///
    /// # Arguments
    /// * `images` - Image tensor of shape (batch, in_chans, img_height, img_width)
    /// * `mode` - Training or evaluation
    ///
    /// # Returns
    /// Class scores of shape (batch, num_classes, img_height, img_width)
    ///
    /// # Errors
    /// Returns an error if the input does not match the configured
    /// resolution or channel count, or tensor operations fail.
    pub fn forward(&self, images: &Tensor, mode: Mode) -> Result<Tensor> {
        let (_b, c, h, w) = images.dims4()?;
        if c != self.config.in_chans {
            bail!(
                "expected {} input channels, got {c}",
                self.config.in_chans
            );
        }
        if (h, w) != (self.config.img_height, self.config.img_width) {
            bail!(
                "input resolution {h}x{w} does not match the configured {}x{}",
                self.config.img_height,
                self.config.img_width
            );
        }

        let x = self.patch_embed.forward(images)?;
        let x = self.pos_embed.forward(&x)?;
        tracing::trace!(shape = ?x.dims(), "embedded patches");

        let x = match &self.blocks {
            Blocks::Sequential(blocks) => {
                let mut x = x;
                for block in blocks {
                    x = block.forward(&x, mode)?;
                }
                x
            }
            Blocks::EncoderDecoder { down, up } => {
                let skips = encode(down, &x, mode)?;
                decode(up, &skips, mode)?
            }
        };

        self.head.forward(&x, self.config.grid(), (h, w))
    }

    /// Hard per-pixel predictions, shape (batch, img_height, img_width).
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn predict(&self, images: &Tensor) -> Result<Tensor> {
        let scores = self.forward(images, Mode::Eval)?;
        crate::labels::predict(&scores)
    }

    /// Get the model configuration.
    #[must_use]
    pub fn config(&self) -> &ViTConfig {
        &self.config
    }

    /// Get the device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The learned positional embedding, shape (1, num_patches, embed_dim).
    #[must_use]
    pub fn pos_embed(&self) -> &Tensor {
        self.pos_embed.weights()
    }
}

/// Run every down block on the same embedded input.
///
/// The blocks are not chained: stage `i` sees `x`, not stage `i - 1`'s
/// output. Returns one output per stage, in stage order.
fn encode(down: &[TransformerBlock], x: &Tensor, mode: Mode) -> Result<Vec<Tensor>> {
    down.iter().map(|block| block.forward(x, mode)).collect()
}

/// Decode path over the stage outputs.
///
/// Starts from the last stage; up block `j` is followed by adding
/// `skips[len - 1 - j]`.
fn decode(up: &[TransformerBlock], skips: &[Tensor], mode: Mode) -> Result<Tensor> {
    let Some(last) = skips.last() else {
        bail!("decoder needs at least one encoder stage");
    };
    if up.len() != skips.len() {
        bail!(
            "decoder has {} up blocks for {} encoder stages",
            up.len(),
            skips.len()
        );
    }

    let mut y = last.clone();
    for (j, block) in up.iter().enumerate() {
        let skip = &skips[skips.len() - 1 - j];
        y = (block.forward(&y, mode)? + skip)?;
    }
    Ok(y)
}

/// Load a SegViT model from a safetensors file.
///
/// # Errors
/// Returns an error if file loading or model construction fails.
pub fn load_model(path: &std::path::Path, config: ViTConfig, device: &Device) -> Result<SegViT> {
    let data = std::fs::read(path)?;
    let vb = VarBuilder::from_buffered_safetensors(data, DType::F32, device)?;
    SegViT::new(config, vb)
}

/// Load a SegViT model from in-memory safetensors bytes.
///
/// # Errors
/// Returns an error if the buffer cannot be parsed as safetensors or model
/// construction fails.
pub fn load_model_from_bytes(data: &[u8], config: ViTConfig, device: &Device) -> Result<SegViT> {
    let vb = VarBuilder::from_buffered_safetensors(data.to_vec(), DType::F32, device)?;
    SegViT::new(config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(config: &ViTConfig, batch: usize) -> Tensor {
        Tensor::randn(
            0f32,
            1.,
            (batch, config.in_chans, config.img_height, config.img_width),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_forward_shapes_with_random_init() {
        let device = Device::Cpu;
        let config = ViTConfig::tiny();
        let varmap = VarMap::new();
        let model = SegViT::init(config.clone(), &varmap, &device, 0).unwrap();

        let scores = model.forward(&images(&config, 2), Mode::Eval).unwrap();
        assert_eq!(scores.dims(), &[2, config.num_classes, 32, 32]);

        let preds = model.predict(&images(&config, 2)).unwrap();
        assert_eq!(preds.dims(), &[2, 32, 32]);
    }

    #[test]
    fn test_encoder_decoder_forward_shapes() {
        let device = Device::Cpu;
        let config = ViTConfig {
            topology: Topology::EncoderDecoder,
            depth: 3,
            ..ViTConfig::tiny()
        };
        let varmap = VarMap::new();
        let model = SegViT::init(config.clone(), &varmap, &device, 0).unwrap();

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n.starts_with("down_blocks.2.")));
        assert!(names.iter().any(|n| n.starts_with("up_blocks.2.")));
        assert!(!names.iter().any(|n| n.starts_with("blocks.")));

        let scores = model.forward(&images(&config, 1), Mode::Train).unwrap();
        assert_eq!(scores.dims(), &[1, config.num_classes, 32, 32]);
    }

    #[test]
    fn test_rejects_wrong_resolution_and_channels() {
        let device = Device::Cpu;
        let config = ViTConfig::tiny();
        let varmap = VarMap::new();
        let model = SegViT::init(config, &varmap, &device, 0).unwrap();

        let x = Tensor::zeros((1, 3, 48, 32), DType::F32, &device).unwrap();
        let err = model.forward(&x, Mode::Eval).err().unwrap().to_string();
        assert!(err.contains("48x32"), "{err}");

        let x = Tensor::zeros((1, 1, 32, 32), DType::F32, &device).unwrap();
        assert!(model.forward(&x, Mode::Eval).is_err());
    }

    #[test]
    fn test_init_is_seeded() {
        let device = Device::Cpu;
        let a = SegViT::init(ViTConfig::tiny(), &VarMap::new(), &device, 11).unwrap();
        let b = SegViT::init(ViTConfig::tiny(), &VarMap::new(), &device, 11).unwrap();
        let a: Vec<f32> = a.pos_embed().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.pos_embed().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().any(|v| *v != 0.0));
        assert!(a.iter().all(|v| v.abs() <= 0.04 + 1e-7));
    }

    #[test]
    fn test_decode_adds_skips_in_reverse() {
        // Blocks whose branches are zeroed act as identity, leaving only the
        // skip arithmetic: y = s2 + s2 + s1 + s0.
        let device = Device::Cpu;
        let config = ViTConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let up: Vec<TransformerBlock> = (0..3)
            .map(|i| TransformerBlock::new(&config, vb.pp(format!("up.{i}"))).unwrap())
            .collect();
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.contains("fc2") || name.contains("proj") {
                var.set(&var.zeros_like().unwrap()).unwrap();
            }
        }

        let skips: Vec<Tensor> = [1f32, 10., 100.]
            .iter()
            .map(|v| {
                (Tensor::ones((1, 2, config.embed_dim), DType::F32, &device).unwrap() * f64::from(*v))
                    .unwrap()
            })
            .collect();
        let y = decode(&up, &skips, Mode::Eval).unwrap();
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|x| (x - 211.0).abs() < 1e-4), "{v:?}");

        assert!(decode(&up[..2], &skips, Mode::Eval).is_err());
    }
}
