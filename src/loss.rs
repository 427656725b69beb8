//! Dice losses over class scores with an ignore label.
//!
//! Both losses take raw scores of shape (batch, num_classes, height, width)
//! and an integer label map of shape (batch, height, width).

use candle_core::{D, DType, Result, Tensor, bail};
use serde::{Deserialize, Serialize};

use crate::labels::{IGNORE_INDEX, NUM_TRAIN_CLASSES};

/// Which Dice formulation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiceVariant {
    /// Per-sample, per-class Dice averaged over classes then batch.
    #[default]
    Mean,
    /// One Dice over the whole batch with inverse squared support weights.
    Generalized,
}

/// Dice loss settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiceConfig {
    pub num_classes: usize,
    /// Label value that contributes nothing to the one-hot targets
    pub ignore_index: u32,
    /// Smoothing term added to numerator and denominator
    pub epsilon: f64,
    #[serde(default)]
    pub variant: DiceVariant,
}

impl Default for DiceConfig {
    fn default() -> Self {
        Self {
            num_classes: NUM_TRAIN_CLASSES,
            ignore_index: IGNORE_INDEX,
            epsilon: 1e-6,
            variant: DiceVariant::Mean,
        }
    }
}

impl DiceConfig {
    /// Validate the settings.
    ///
    /// # Errors
    /// Returns an error if `num_classes` is zero or `epsilon` is not a
    /// positive finite number.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            bail!("num_classes must be positive");
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            bail!("epsilon must be positive and finite, got {}", self.epsilon);
        }
        Ok(())
    }

    /// Build the configured loss.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid.
    pub fn build(&self) -> Result<DiceLoss> {
        self.validate()?;
        Ok(match self.variant {
            DiceVariant::Mean => DiceLoss::Mean(MeanDice::new(self.clone())),
            DiceVariant::Generalized => DiceLoss::Generalized(GeneralizedDice::new(self.clone())),
        })
    }
}

/// Either Dice formulation behind one `forward`.
#[derive(Debug, Clone)]
pub enum DiceLoss {
    Mean(MeanDice),
    Generalized(GeneralizedDice),
}

impl DiceLoss {
    /// Scalar loss.
    ///
    /// # Errors
    /// See [`MeanDice::forward`].
    pub fn forward(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mean(loss) => loss.forward(scores, labels),
            Self::Generalized(loss) => loss.forward(scores, labels),
        }
    }
}

/// Multi-class Dice loss with an ignore label.
///
/// For sample `b` and class `c`, with `p` the softmax probabilities and `y`
/// the masked one-hot labels:
///
/// ```text
/// I = Σ_hw p·y      U = Σ_hw p + Σ_hw y
/// dice[b, c] = (2I + ε) / (U + ε)
/// loss = 1 - mean_b(mean_c(dice))
/// ```
///
/// Probabilities at ignored pixels are kept in `Σ p`, so a fully ignored
/// label map scores close to 1 rather than 0.
#[derive(Debug, Clone)]
pub struct MeanDice {
    config: DiceConfig,
}

impl MeanDice {
    #[must_use]
    pub fn new(config: DiceConfig) -> Self {
        Self { config }
    }

    /// Batch-mean loss as a scalar tensor.
    ///
    /// # Errors
    /// Returns an error if shapes disagree, the class axis does not match
    /// `num_classes`, or a label is neither a valid class nor the ignore
    /// value.
    pub fn forward(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor> {
        self.per_sample(scores, labels)?.mean_all()
    }

    /// Loss of every sample, shape (batch,).
    ///
    /// # Errors
    /// Same as [`MeanDice::forward`].
    pub fn per_sample(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let dice = self.dice_scores(scores, labels)?;
        dice.mean(D::Minus1)?.affine(-1.0, 1.0)
    }

    /// Dice score of every sample and class, shape (batch, num_classes).
    ///
    /// # Errors
    /// Same as [`MeanDice::forward`].
    pub fn dice_scores(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (probs, one_hot) = prepare(&self.config, scores, labels)?;
        let eps = self.config.epsilon;

        let intersection = (&probs * &one_hot)?.sum((2, 3))?;
        let union = (probs.sum((2, 3))? + one_hot.sum((2, 3))?)?;

        let numerator = intersection.affine(2.0, eps)?;
        let denominator = union.affine(1.0, eps)?;
        numerator / denominator
    }
}

/// Generalized Dice loss.
///
/// Class weights `w_c = 1 / (n_c² + ε)` where `n_c` is the number of valid
/// pixels labeled `c` across the whole batch:
///
/// ```text
/// I = Σ_c w_c Σ_{b,hw} p·y      U = Σ_c w_c Σ_{b,hw} (p + y)
/// loss = 1 - (2I + ε) / (U + ε)
/// ```
///
/// The batch is aggregated before the ratio, so per-sample losses are not
/// defined for this variant.
#[derive(Debug, Clone)]
pub struct GeneralizedDice {
    config: DiceConfig,
}

impl GeneralizedDice {
    #[must_use]
    pub fn new(config: DiceConfig) -> Self {
        Self { config }
    }

    /// Scalar loss.
    ///
    /// # Errors
    /// Same as [`MeanDice::forward`].
    pub fn forward(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (probs, one_hot) = prepare(&self.config, scores, labels)?;
        let eps = self.config.epsilon;

        // Per-class totals over batch and space: (K,)
        let support = one_hot.sum((0, 2, 3))?;
        let weights = support.sqr()?.affine(1.0, eps)?.recip()?;

        let intersection = (&probs * &one_hot)?.sum((0, 2, 3))?;
        let union = (probs.sum((0, 2, 3))? + support)?;

        let intersection = (weights.clone() * intersection)?.sum_all()?;
        let union = (weights * union)?.sum_all()?;

        let dice = (intersection.affine(2.0, eps)? / union.affine(1.0, eps)?)?;
        dice.affine(-1.0, 1.0)
    }
}

/// Validate inputs and return `(probabilities, masked one-hot labels)`,
/// both f32 of shape (batch, num_classes, height, width).
///
/// The validity mask is built first and the one-hot comparison is guarded
/// by it, so an ignored pixel never sets any class row, whatever the ignore
/// value is.
fn prepare(config: &DiceConfig, scores: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
    let (b, k, h, w) = scores.dims4()?;
    let (lb, lh, lw) = labels.dims3()?;
    if (b, h, w) != (lb, lh, lw) {
        bail!("scores (batch={b}, {h}x{w}) and labels (batch={lb}, {lh}x{lw}) disagree");
    }
    if k != config.num_classes {
        bail!(
            "scores have {k} classes, loss is configured for {}",
            config.num_classes
        );
    }
    if !labels.dtype().is_int() {
        bail!("labels must be an integer tensor, got {:?}", labels.dtype());
    }

    let device = scores.device();
    let labels = labels.to_dtype(DType::I64)?;
    let ignore = i64::from(config.ignore_index);

    // (B, H, W) u8, 1 where the label takes part in the loss
    let valid = labels.ne(ignore)?;
    check_label_range(&labels, &valid, k)?;

    // Guarded one-hot: (B, 1, H, W) == (1, K, 1, 1), then AND with validity.
    #[allow(clippy::cast_possible_wrap)]
    let classes = Tensor::arange(0i64, k as i64, device)?.reshape((1, k, 1, 1))?;
    let one_hot = labels
        .unsqueeze(1)?
        .broadcast_eq(&classes)?
        .broadcast_mul(&valid.unsqueeze(1)?)?
        .to_dtype(DType::F32)?;

    let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, 1)?;
    Ok((probs, one_hot))
}

/// Fail if any non-ignored label is outside `[0, num_classes)`.
fn check_label_range(labels: &Tensor, valid: &Tensor, num_classes: usize) -> Result<()> {
    if labels.elem_count() == 0 {
        return Ok(());
    }
    // Ignored pixels are replaced by 0 so they never trip the range check.
    let guarded = valid.where_cond(labels, &labels.zeros_like()?)?;
    let lo = guarded.flatten_all()?.min(0)?.to_scalar::<i64>()?;
    let hi = guarded.flatten_all()?.max(0)?.to_scalar::<i64>()?;
    let limit = i64::try_from(num_classes).unwrap_or(i64::MAX);
    if lo < 0 || hi >= limit {
        bail!(
            "label values must be in [0, {num_classes}) or the ignore value, found range [{lo}, {hi}]"
        );
    }
    Ok(())
}
