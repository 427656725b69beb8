use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use safetensors::SafeTensors;

use crate::model::{PositionalEmbedding, SegViT, ViTConfig, load_model_from_bytes};

/// File name of the config expected next to a weights file.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Load a model from a weights file on disk, reading `config.json` from the
/// same directory when available.
///
/// # Errors
/// Returns an error if the weights or config cannot be loaded, or the
/// weights were exported for a different resolution or width than the
/// config describes.
pub fn load_external_model(model_path: &Path, device: &Device) -> Result<SegViT> {
    let config = load_config_for_model(model_path)?;
    let data = std::fs::read(model_path)
        .with_context(|| format!("read weights {}", model_path.display()))?;
    tracing::debug!(
        path = %model_path.display(),
        bytes = data.len(),
        "loading SegViT weights"
    );
    load_bytes_checked(&data, config, device)
        .with_context(|| format!("load weights {}", model_path.display()))
}

/// Read the sibling `config.json` of a weights file, or the default config
/// when there is none.
///
/// # Errors
/// Returns an error if the config exists but cannot be read, parsed, or
/// validated.
pub fn load_config_for_model(model_path: &Path) -> Result<ViTConfig> {
    let Some(parent) = model_path.parent() else {
        return Ok(ViTConfig::default());
    };

    let config_path = parent.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        tracing::debug!(
            path = %config_path.display(),
            "no config next to weights, using default"
        );
        return Ok(ViTConfig::default());
    }

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let cfg: ViTConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;
    cfg.validate().context("invalid ViTConfig")?;
    Ok(cfg)
}

/// Save a trained model's variables and its config side by side.
///
/// Writes `weights_path` and `config.json` in the same directory.
///
/// # Errors
/// Returns an error if either file cannot be written.
pub fn save_model(varmap: &VarMap, config: &ViTConfig, weights_path: &Path) -> Result<()> {
    varmap
        .save(weights_path)
        .with_context(|| format!("write weights {}", weights_path.display()))?;
    let config_path = weights_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CONFIG_FILE_NAME);
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&config_path, json)
        .with_context(|| format!("write config {}", config_path.display()))?;
    Ok(())
}

fn load_bytes_checked(data: &[u8], config: ViTConfig, device: &Device) -> Result<SegViT> {
    let Ok(safetensors) = SafeTensors::deserialize(data) else {
        // If it isn't safetensors, downstream loading will fail with a better error.
        return load_model_from_bytes(data, config, device).context("load weights bytes");
    };
    check_pos_embed(&safetensors, &config)?;
    load_model_from_bytes(data, config, device).context("load float safetensors")
}

/// The positional embedding fixes the input resolution, so a mismatch there
/// gets an explicit message instead of a generic shape error.
fn check_pos_embed(safetensors: &SafeTensors<'_>, config: &ViTConfig) -> Result<()> {
    let Ok(view) = safetensors.tensor(PositionalEmbedding::NAME) else {
        anyhow::bail!(
            "weights have no `{}` tensor; not a SegViT export",
            PositionalEmbedding::NAME
        );
    };
    let expected = [1, config.num_patches(), config.embed_dim];
    if view.shape() != expected {
        let (rows, cols) = config.grid();
        anyhow::bail!(
            "`{}` has shape {:?}, but the config expects {:?} ({}x{} input, {rows}x{cols} patches of {}px, embed_dim {})",
            PositionalEmbedding::NAME,
            view.shape(),
            expected,
            config.img_height,
            config.img_width,
            config.patch_size,
            config.embed_dim
        );
    }
    Ok(())
}
