use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, GenericImageView};

use crate::Result;

/// Default square edge the encoder expects.
pub const IMAGE_SIZE: usize = 224;

/// Decode an uploaded image and turn it into a `(1, 3, size, size)` tensor with
/// values in `[0.0, 1.0]`.
pub fn preprocess_image(bytes: &[u8], size: usize, device: &Device) -> Result<Tensor> {
    let image = image::load_from_memory(bytes)?;
    let (w, h) = image.dimensions();
    let edge = u32::try_from(size).unwrap_or(u32::MAX);
    tracing::debug!("Resizing {w}x{h} upload to {edge}x{edge}.");

    let rgb = image
        .resize_exact(edge, edge, FilterType::CatmullRom)
        .to_rgb8();
    let (w, h) = rgb.dimensions();
    let pixels = Tensor::from_vec(rgb.into_raw(), (h as usize, w as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    // Rescale to between 0 and 1
    let pixels = (pixels / 255.0f64)?.unsqueeze(0)?;
    Ok(pixels.to_device(device)?)
}
