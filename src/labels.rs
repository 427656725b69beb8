//! Cityscapes label definitions, train-id conversion and prediction helpers.

use candle_core::{DType, Device, Result, Tensor, bail};

/// Label value excluded from training and evaluation.
pub const IGNORE_INDEX: u32 = 255;

/// Number of classes in the train-id space.
pub const NUM_TRAIN_CLASSES: usize = 19;

/// One Cityscapes label definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CityscapesClass {
    pub name: &'static str,
    /// Raw id stored in the `*_labelIds.png` annotations
    pub id: u8,
    /// Compact id used for training, or [`IGNORE_INDEX`]
    pub train_id: u32,
    pub color: [u8; 3],
}

const fn class(name: &'static str, id: u8, train_id: u32, color: [u8; 3]) -> CityscapesClass {
    CityscapesClass {
        name,
        id,
        train_id,
        color,
    }
}

/// The Cityscapes label set, ids 0 to 33.
///
/// The `license plate` entry (id -1) never appears in `*_labelIds.png`
/// annotations, so it has no row here.
pub const CITYSCAPES_CLASSES: [CityscapesClass; 34] = [
    class("unlabeled", 0, 255, [0, 0, 0]),
    class("ego vehicle", 1, 255, [0, 0, 0]),
    class("rectification border", 2, 255, [0, 0, 0]),
    class("out of roi", 3, 255, [0, 0, 0]),
    class("static", 4, 255, [0, 0, 0]),
    class("dynamic", 5, 255, [111, 74, 0]),
    class("ground", 6, 255, [81, 0, 81]),
    class("road", 7, 0, [128, 64, 128]),
    class("sidewalk", 8, 1, [244, 35, 232]),
    class("parking", 9, 255, [250, 170, 160]),
    class("rail track", 10, 255, [230, 150, 140]),
    class("building", 11, 2, [70, 70, 70]),
    class("wall", 12, 3, [102, 102, 156]),
    class("fence", 13, 4, [190, 153, 153]),
    class("guard rail", 14, 255, [180, 165, 180]),
    class("bridge", 15, 255, [150, 100, 100]),
    class("tunnel", 16, 255, [150, 120, 90]),
    class("pole", 17, 5, [153, 153, 153]),
    class("polegroup", 18, 255, [153, 153, 153]),
    class("traffic light", 19, 6, [250, 170, 30]),
    class("traffic sign", 20, 7, [220, 220, 0]),
    class("vegetation", 21, 8, [107, 142, 35]),
    class("terrain", 22, 9, [152, 251, 152]),
    class("sky", 23, 10, [70, 130, 180]),
    class("person", 24, 11, [220, 20, 60]),
    class("rider", 25, 12, [255, 0, 0]),
    class("car", 26, 13, [0, 0, 142]),
    class("truck", 27, 14, [0, 0, 70]),
    class("bus", 28, 15, [0, 60, 100]),
    class("caravan", 29, 255, [0, 0, 90]),
    class("trailer", 30, 255, [0, 0, 110]),
    class("train", 31, 16, [0, 80, 100]),
    class("motorcycle", 32, 17, [0, 0, 230]),
    class("bicycle", 33, 18, [119, 11, 32]),
];

/// Lookup table from raw id to train id; unknown ids map to [`IGNORE_INDEX`].
fn id_to_train_id_table() -> Vec<u32> {
    let mut table = vec![IGNORE_INDEX; 256];
    for c in &CITYSCAPES_CLASSES {
        table[usize::from(c.id)] = c.train_id;
    }
    table
}

/// Lookup table from train id to RGB; ignore and unknown ids are black.
fn train_id_palette() -> Vec<u8> {
    let mut palette = vec![0u8; 256 * 3];
    for c in CITYSCAPES_CLASSES.iter().filter(|c| c.train_id != IGNORE_INDEX) {
        let base = c.train_id as usize * 3;
        palette[base..base + 3].copy_from_slice(&c.color);
    }
    palette
}

/// Name of a train id, if it is one of the 19 training classes.
#[must_use]
pub fn train_id_name(train_id: u32) -> Option<&'static str> {
    CITYSCAPES_CLASSES
        .iter()
        .find(|c| c.train_id == train_id && train_id != IGNORE_INDEX)
        .map(|c| c.name)
}

/// Convert a raw Cityscapes label map to train ids.
///
/// Accepts any integer dtype with values in `[0, 256)`; the result has the
/// same shape and dtype `u32`.
///
/// # Errors
/// Returns an error if the tensor is not an integer tensor or holds values
/// outside the raw id range.
pub fn convert_to_train_id(labels: &Tensor) -> Result<Tensor> {
    let flat = to_index(labels)?;
    let table = Tensor::from_vec(id_to_train_id_table(), 256, labels.device())?;
    table.index_select(&flat, 0)?.reshape(labels.shape())
}

/// Hard predictions from class scores: argmax over the class axis.
///
/// Softmax is monotonic, so the argmax is taken on the scores directly.
///
/// # Arguments
/// * `scores` - Class scores of shape (batch, num_classes, height, width)
///
/// # Returns
/// Train ids of shape (batch, height, width), dtype `u32`
///
/// # Errors
/// Returns an error if the input is not rank 4.
pub fn predict(scores: &Tensor) -> Result<Tensor> {
    let (_b, _k, _h, _w) = scores.dims4()?;
    scores.argmax(1)
}

/// Render a train-id map as an RGB image.
///
/// # Arguments
/// * `train_ids` - Integer tensor of shape (batch, height, width)
///
/// # Returns
/// Color image of shape (batch, 3, height, width), dtype `u8`
///
/// # Errors
/// Returns an error if the input is not a rank-3 integer tensor with values
/// in `[0, 256)`.
pub fn colorize(train_ids: &Tensor) -> Result<Tensor> {
    let (b, h, w) = train_ids.dims3()?;
    let flat = to_index(train_ids)?;
    let palette = Tensor::from_vec(train_id_palette(), (256, 3), train_ids.device())?;
    palette
        .index_select(&flat, 0)?
        .reshape((b, h, w, 3))?
        .permute((0, 3, 1, 2))?
        .contiguous()
}

/// Flatten an integer label tensor into `u32` indices checked to lie in
/// `[0, 256)`.
fn to_index(labels: &Tensor) -> Result<Tensor> {
    if !labels.dtype().is_int() {
        bail!("label tensor must be an integer tensor, got {:?}", labels.dtype());
    }
    let flat = labels.flatten_all()?;
    if flat.elem_count() > 0 {
        let as_i64 = flat.to_dtype(DType::I64)?;
        let lo = as_i64.min(0)?.to_scalar::<i64>()?;
        let hi = as_i64.max(0)?.to_scalar::<i64>()?;
        if lo < 0 || hi > 255 {
            bail!("label values must lie in [0, 255], found range [{lo}, {hi}]");
        }
    }
    flat.to_dtype(DType::U32)
}

/// All 19 train-class colors as a (19, 3) `u8` tensor, in train-id order.
///
/// # Errors
/// Returns an error if tensor creation fails.
pub fn train_palette(device: &Device) -> Result<Tensor> {
    let palette = train_id_palette();
    Tensor::from_vec(
        palette[..NUM_TRAIN_CLASSES * 3].to_vec(),
        (NUM_TRAIN_CLASSES, 3),
        device,
    )
}
