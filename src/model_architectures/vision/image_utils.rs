//! Image preprocessing utilities for the selective patch pipeline
//!
//! Handles decoding, resizing, normalization, and tensor conversion for the
//! paired inputs the model consumes: the magno (color) image that gets
//! classified and the line drawing that guides patch selection.

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GrayImage, RgbImage};

#[derive(Debug, Clone)]
pub enum ImagePreprocessingError {
    DecodeError(String),
    ResizeError(String),
    ConversionError(String),
}

impl std::fmt::Display for ImagePreprocessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImagePreprocessingError::DecodeError(msg) => write!(f, "Decode error: {}", msg),
            ImagePreprocessingError::ResizeError(msg) => write!(f, "Resize error: {}", msg),
            ImagePreprocessingError::ConversionError(msg) => write!(f, "Conversion error: {}", msg),
        }
    }
}

impl std::error::Error for ImagePreprocessingError {}

/// Preprocess a magno (color) image for the selective model
///
/// Steps:
/// 1. Decode image from bytes (JPEG/PNG)
/// 2. Resize the shorter side to `img_size`, then center crop
/// 3. Normalize pixel values with ImageNet mean/std
/// 4. Convert to tensor `[1, 3, img_size, img_size]`
pub fn preprocess_magno_image(
    image_data: &[u8],
    img_size: usize,
    device: &Device,
) -> Result<Tensor, ImagePreprocessingError> {
    let img = decode_image(image_data)?;
    let resized = resize_and_center_crop_rgb(&img, img_size as u32)?;
    rgb_to_tensor(&resized, device)
}

/// Preprocess a line drawing for the selective model
///
/// The drawing is converted to a single channel, resized/cropped to match
/// the magno image, and scaled to [0, 1] (0 = background, nonzero = line).
/// Output shape `[1, 1, img_size, img_size]`.
pub fn preprocess_line_drawing(
    image_data: &[u8],
    img_size: usize,
    device: &Device,
) -> Result<Tensor, ImagePreprocessingError> {
    let img = decode_image(image_data)?;
    let resized = resize_and_center_crop_gray(&img, img_size as u32)?;
    gray_to_tensor(&resized, device)
}

fn decode_image(data: &[u8]) -> Result<DynamicImage, ImagePreprocessingError> {
    image::load_from_memory(data).map_err(|e| ImagePreprocessingError::DecodeError(e.to_string()))
}

fn resize_dims(orig_width: u32, orig_height: u32, target: u32) -> (u32, u32) {
    // Resize the shorter side to the target, keeping aspect ratio
    if orig_width < orig_height {
        (target, (orig_height * target) / orig_width)
    } else {
        ((orig_width * target) / orig_height, target)
    }
}

fn resize_and_center_crop_rgb(
    img: &DynamicImage,
    target_size: u32,
) -> Result<RgbImage, ImagePreprocessingError> {
    let rgb_img = img.to_rgb8();
    let (orig_width, orig_height) = rgb_img.dimensions();
    if orig_width == 0 || orig_height == 0 {
        return Err(ImagePreprocessingError::ResizeError(
            "empty input image".to_string(),
        ));
    }
    let (resize_width, resize_height) = resize_dims(orig_width, orig_height, target_size);

    let resized = image::imageops::resize(
        &rgb_img,
        resize_width,
        resize_height,
        image::imageops::FilterType::Lanczos3,
    );

    let crop_x = (resize_width.saturating_sub(target_size)) / 2;
    let crop_y = (resize_height.saturating_sub(target_size)) / 2;
    let cropped =
        image::imageops::crop_imm(&resized, crop_x, crop_y, target_size, target_size).to_image();
    Ok(cropped)
}

fn resize_and_center_crop_gray(
    img: &DynamicImage,
    target_size: u32,
) -> Result<GrayImage, ImagePreprocessingError> {
    let gray_img = img.to_luma8();
    let (orig_width, orig_height) = gray_img.dimensions();
    if orig_width == 0 || orig_height == 0 {
        return Err(ImagePreprocessingError::ResizeError(
            "empty input image".to_string(),
        ));
    }
    let (resize_width, resize_height) = resize_dims(orig_width, orig_height, target_size);

    // Triangle keeps thin strokes from ringing the way Lanczos can
    let resized = image::imageops::resize(
        &gray_img,
        resize_width,
        resize_height,
        image::imageops::FilterType::Triangle,
    );

    let crop_x = (resize_width.saturating_sub(target_size)) / 2;
    let crop_y = (resize_height.saturating_sub(target_size)) / 2;
    let cropped =
        image::imageops::crop_imm(&resized, crop_x, crop_y, target_size, target_size).to_image();
    Ok(cropped)
}

/// Convert an RGB image to a CHW tensor with ImageNet normalization
fn rgb_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor, ImagePreprocessingError> {
    let (width, height) = img.dimensions();
    let mut pixels = Vec::with_capacity(3 * (width * height) as usize);

    let mean = [0.485, 0.456, 0.406];
    let std = [0.229, 0.224, 0.225];

    for c in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                let value = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
                pixels.push(value);
            }
        }
    }

    let tensor = Tensor::from_vec(pixels, (1, 3, height as usize, width as usize), device)
        .map_err(|e| ImagePreprocessingError::ConversionError(e.to_string()))?;
    tensor
        .to_dtype(DType::F32)
        .map_err(|e| ImagePreprocessingError::ConversionError(e.to_string()))
}

/// Convert a grayscale line drawing to a [0, 1] single-channel tensor
fn gray_to_tensor(img: &GrayImage, device: &Device) -> Result<Tensor, ImagePreprocessingError> {
    let (width, height) = img.dimensions();
    let mut pixels = Vec::with_capacity((width * height) as usize);

    for y in 0..height {
        for x in 0..width {
            pixels.push(img.get_pixel(x, y)[0] as f32 / 255.0);
        }
    }

    let tensor = Tensor::from_vec(pixels, (1, 1, height as usize, width as usize), device)
        .map_err(|e| ImagePreprocessingError::ConversionError(e.to_string()))?;
    tensor
        .to_dtype(DType::F32)
        .map_err(|e| ImagePreprocessingError::ConversionError(e.to_string()))
}
