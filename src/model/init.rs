//! Parameter initialization for freshly built models.

use candle_core::{Device, Result, Shape, Tensor};
use candle_nn::VarMap;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

use super::embedding::PositionalEmbedding;

/// Standard deviation used for the positional embedding.
pub const POS_EMBED_STD: f64 = 0.02;

/// Draw from a normal distribution truncated to `[-2 std, 2 std]`.
///
/// Out-of-range draws are rejected and redrawn, so the result follows the
/// truncated density exactly.
///
/// # Errors
/// Returns an error if tensor creation fails.
#[allow(clippy::cast_possible_truncation)]
pub fn trunc_normal<S: Into<Shape>>(
    shape: S,
    std: f64,
    rng: &mut impl Rng,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| loop {
            let z: f64 = rng.sample(StandardNormal);
            if z.abs() <= 2.0 {
                break (z * std) as f32;
            }
        })
        .collect();
    Tensor::from_vec(data, shape, device)
}

/// Replace every positional embedding in `varmap` with a seeded truncated
/// normal draw.
///
/// Returns how many parameters were initialized.
///
/// # Errors
/// Returns an error if a variable cannot be updated.
pub fn trunc_normal_pos_embed(varmap: &VarMap, seed: u64) -> Result<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;

    // Sorted so the draw order, and therefore the values, depend only on the seed.
    let mut names: Vec<&String> = vars
        .keys()
        .filter(|name| name.ends_with(PositionalEmbedding::NAME))
        .collect();
    names.sort();

    for name in &names {
        let var = &vars[*name];
        let fresh = trunc_normal(var.shape().clone(), POS_EMBED_STD, &mut rng, var.device())?
            .to_dtype(var.dtype())?;
        var.set(&fresh)?;
        tracing::debug!(name = %name, shape = ?var.shape(), "initialized positional embedding");
    }
    Ok(names.len())
}
