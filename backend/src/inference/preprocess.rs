use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 128;
pub const CHANNELS: usize = 3;
/// Batch of one, NHWC.
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_SIZE as usize, INPUT_SIZE as usize, CHANNELS];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Converts to RGB, resizes to 128x128 ignoring aspect ratio, scales to [0, 1]
/// and adds the batch dimension.
pub fn preprocess(image: &DynamicImage) -> Result<Array4<f32>, PreprocessError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage);
    }

    let rgb = image.to_rgb8();
    let resized = if (width, height) == (INPUT_SIZE, INPUT_SIZE) {
        rgb
    } else {
        image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom)
    };

    let data: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect();
    Ok(Array4::from_shape_vec(INPUT_SHAPE, data)?)
}

pub fn preprocess_bytes(bytes: &[u8]) -> Result<Array4<f32>, PreprocessError> {
    preprocess(&decode(bytes)?)
}
