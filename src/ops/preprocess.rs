// ============================================================================
// PREPROCESSING — stroke buffer → model input tensor
// ============================================================================

use image::GrayImage;
use image::imageops::{self, FilterType};

/// Side length the classifier was trained on.
pub const MODEL_SIDE: u32 = 28;

/// NHWC layout: one sample, 28 rows, 28 columns, one channel.
pub const INPUT_SHAPE: [i64; 4] = [1, MODEL_SIDE as i64, MODEL_SIDE as i64, 1];

/// A single-sample float tensor ready for the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInput {
    pub shape: [i64; 4],
    /// Row-major pixel values in [0, 1], ink bright on a dark background.
    pub data: Vec<f32>,
}

impl ModelInput {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product::<i64>() as usize
    }

    /// Value at row `y`, column `x`.
    pub fn at(&self, x: u32, y: u32) -> f32 {
        self.data[(y * MODEL_SIDE + x) as usize]
    }
}

/// Scale a 0–255 intensity to [0, 1] and invert it (white paper → 0.0).
#[inline]
pub fn normalize_pixel(v: u8) -> f32 {
    1.0 - v as f32 / 255.0
}

/// Downsample with Lanczos3 to 28×28, normalize and invert.
///
/// Returns `None` for an empty raster, which cannot be resampled.
pub fn to_model_input(buffer: &GrayImage) -> Option<ModelInput> {
    if buffer.width() == 0 || buffer.height() == 0 {
        return None;
    }

    let resized = if buffer.dimensions() == (MODEL_SIDE, MODEL_SIDE) {
        buffer.clone()
    } else {
        imageops::resize(buffer, MODEL_SIDE, MODEL_SIDE, FilterType::Lanczos3)
    };

    // Lanczos rings can overshoot, but the resize clamps back into u8 so every
    // normalized value stays inside [0, 1].
    let data = resized.pixels().map(|p| normalize_pixel(p.0[0])).collect();

    Some(ModelInput {
        shape: INPUT_SHAPE,
        data,
    })
}
