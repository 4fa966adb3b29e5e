use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use tract_onnx::prelude::tract_ndarray::Array4;

use crate::error::InferenceError;

/// Square side length the classifier was trained on.
pub const INPUT_SIZE: u32 = 128;
pub const INPUT_CHANNELS: usize = 3;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// NHWC input batch of one image, values in [0, 1].
pub type InputTensor = Array4<f32>;

pub fn input_shape() -> [usize; 4] {
    [1, INPUT_SIZE as usize, INPUT_SIZE as usize, INPUT_CHANNELS]
}

pub fn is_supported_upload(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lowered = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&lowered.as_str())
        })
        .unwrap_or(false)
}

pub fn load_upload(path: &Path) -> Result<DynamicImage, InferenceError> {
    if !is_supported_upload(path) {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();
        return Err(InferenceError::UnsupportedFormat(ext));
    }
    let bytes = std::fs::read(path).map_err(|source| InferenceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Exact 128x128 RGB resample, ignoring aspect ratio. Images already at the
/// input size are only converted, never resampled.
pub fn resize_to_input(image: &DynamicImage) -> RgbImage {
    let rgb = image.to_rgb8();
    if rgb.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
        return rgb;
    }
    image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom)
}

pub fn preprocess(image: &DynamicImage) -> InputTensor {
    let rgb = resize_to_input(image);
    let side = INPUT_SIZE as usize;
    Array4::from_shape_fn((1, side, side, INPUT_CHANNELS), |(_, y, x, c)| {
        f32::from(rgb.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}
