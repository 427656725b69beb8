use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::VarMap;

use segvit::labels::{self, IGNORE_INDEX};
use segvit::loss::{DiceConfig, DiceVariant, MeanDice};
use segvit::model::{Mode, SegViT, Topology, ViTConfig};
use segvit::weights;

fn temp_dir(tag: &str) -> PathBuf {
    let uniq = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("timestamp")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("segvit_it_{tag}_{uniq}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Left half road (0), right half sidewalk (1), bottom row ignored.
fn two_region_labels(config: &ViTConfig, device: &Device) -> Result<Tensor> {
    let (h, w) = (config.img_height, config.img_width);
    let mut data = Vec::with_capacity(h * w);
    for y in 0..h {
        for x in 0..w {
            data.push(if y == h - 1 {
                IGNORE_INDEX
            } else if x < w / 2 {
                0
            } else {
                1
            });
        }
    }
    Ok(Tensor::from_vec(data, (1, h, w), device)?)
}

#[test]
fn crate_boots() {
    let _cfg = segvit::model::ViTConfig::default();
    let _loss = segvit::loss::DiceConfig::default();
}

#[test]
fn golden_dice_value() -> Result<()> {
    let device = Device::Cpu;
    let scores = Tensor::zeros((1, 19, 4, 4), DType::F32, &device)?;
    let labels = Tensor::full(7u32, (1, 4, 4), &device)?;
    let loss = MeanDice::new(DiceConfig::default())
        .forward(&scores, &labels)?
        .to_scalar::<f32>()?;

    let eps = 1e-6_f64;
    let p = 1.0 / 19.0;
    let hot = (2.0 * 16.0 * p + eps) / (16.0 * p + 16.0 + eps);
    let cold = eps / (16.0 * p + eps);
    #[allow(clippy::cast_possible_truncation)]
    let expected = (1.0 - (hot + 18.0 * cold) / 19.0) as f32;

    anyhow::ensure!(
        (loss - expected).abs() < 1e-5,
        "loss {loss} != expected {expected}"
    );
    Ok(())
}

#[test]
fn forward_then_loss_for_both_topologies() -> Result<()> {
    let device = Device::Cpu;
    for topology in [Topology::Sequential, Topology::EncoderDecoder] {
        let config = ViTConfig {
            topology,
            ..ViTConfig::tiny()
        };
        let varmap = VarMap::new();
        let model = SegViT::init(config.clone(), &varmap, &device, 1)?;

        let images = Tensor::randn(0f32, 1., (2, 3, 32, 32), &device)?;
        let labels = Tensor::cat(
            &[
                two_region_labels(&config, &device)?,
                two_region_labels(&config, &device)?,
            ],
            0,
        )?;

        let scores = model.forward(&images, Mode::Train)?;
        for variant in [DiceVariant::Mean, DiceVariant::Generalized] {
            let loss = DiceConfig {
                variant,
                ..DiceConfig::default()
            }
            .build()?
            .forward(&scores, &labels)?
            .to_scalar::<f32>()?;
            anyhow::ensure!(
                loss.is_finite() && (0.0..=1.0).contains(&loss),
                "{topology:?}/{variant:?}: loss {loss}"
            );
        }

        let colors = labels::colorize(&model.predict(&images)?)?;
        anyhow::ensure!(colors.dims() == [2, 3, 32, 32]);
    }
    Ok(())
}

#[test]
fn saved_weights_reload_to_identical_outputs() -> Result<()> {
    let device = Device::Cpu;
    let dir = temp_dir("roundtrip");
    let path = dir.join("model.safetensors");

    let config = ViTConfig {
        topology: Topology::EncoderDecoder,
        qkv_bias: true,
        ..ViTConfig::tiny()
    };
    let varmap = VarMap::new();
    let model = SegViT::init(config.clone(), &varmap, &device, 5)?;
    weights::save_model(&varmap, &config, &path)?;

    let reloaded = weights::load_external_model(&path, &device)?;
    anyhow::ensure!(reloaded.config() == &config);

    let images = Tensor::randn(0f32, 1., (1, 3, 32, 32), &device)?;
    let a = model.forward(&images, Mode::Eval)?;
    let b = reloaded.forward(&images, Mode::Eval)?;
    let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
    anyhow::ensure!(diff < 1e-6, "max diff {diff}");
    Ok(())
}

#[test]
fn adamw_steps_reduce_dice_loss() -> Result<()> {
    let device = Device::Cpu;
    let config = ViTConfig::tiny();
    let varmap = VarMap::new();
    let model = SegViT::init(config.clone(), &varmap, &device, 3)?;
    let loss_fn = MeanDice::new(DiceConfig::default());

    let images = Tensor::randn(0f32, 1., (1, 3, 32, 32), &device)?;
    let labels = two_region_labels(&config, &device)?;

    let mut opt = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: 5e-3,
            weight_decay: 1e-3,
            ..ParamsAdamW::default()
        },
    )?;

    let first = loss_fn
        .forward(&model.forward(&images, Mode::Train)?, &labels)?
        .to_scalar::<f32>()?;
    for _ in 0..30 {
        let loss = loss_fn.forward(&model.forward(&images, Mode::Train)?, &labels)?;
        opt.backward_step(&loss)?;
    }
    let last = loss_fn
        .forward(&model.forward(&images, Mode::Eval)?, &labels)?
        .to_scalar::<f32>()?;

    anyhow::ensure!(last < first, "loss did not improve: {first} -> {last}");
    Ok(())
}
