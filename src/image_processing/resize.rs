use anyhow::Result;
use fast_image_resize::{images::Image, ResizeOptions, Resizer};
use image::{imageops, ImageBuffer, Rgb, RgbImage};
use std::num::NonZeroU32;

use super::subject_detection::FaceGeometry;
use super::FramingConstants;
use crate::enhancement::Variant;

/// Face-anchored crop window in display-space pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// The ideal placement fell outside the image and was shifted back in
    pub edge_clamped: bool,
}

/// Compute the crop rectangle for a variant
///
/// Crop height follows the estimated face height, width follows the
/// variant's aspect ratio. Horizontally the face is centered, vertically it
/// sits at the variant's headroom fraction from the top. The result is
/// always inside the image.
pub fn compute_crop(geometry: &FaceGeometry, variant: Variant, framing: &FramingConstants) -> CropRect {
    let img_w = geometry.image_width.max(1);
    let img_h = geometry.image_height.max(1);
    let aspect = variant.aspect_ratio();

    let mut crop_h = geometry.face_height * framing.height_multiplier(variant);
    let crop_w = crop_h * aspect;

    if crop_w > img_w as f64 || crop_h > img_h as f64 {
        // Shrink proportionally until the limiting edge fits exactly
        crop_h = if (img_w as f64 / crop_w) < (img_h as f64 / crop_h) {
            img_w as f64 / aspect
        } else {
            img_h as f64
        };
    }

    let mut height = (crop_h.floor() as u32).clamp(1, img_h);
    let mut width = ((height as f64 * aspect).round() as u32).max(1);
    if width > img_w {
        width = img_w;
        height = ((width as f64 / aspect).floor() as u32).clamp(1, img_h);
        width = ((height as f64 * aspect).round() as u32).clamp(1, img_w);
    }

    let ideal_x = geometry.face_x - width as f64 / 2.0;
    let ideal_y = geometry.face_y - height as f64 * framing.face_top_fraction(variant);
    let max_x = (img_w - width) as f64;
    let max_y = (img_h - height) as f64;

    let x = ideal_x.clamp(0.0, max_x);
    let y = ideal_y.clamp(0.0, max_y);
    let edge_clamped = (x - ideal_x).abs() > 0.5 || (y - ideal_y).abs() > 0.5;

    CropRect {
        x: x.round() as u32,
        y: y.round() as u32,
        width,
        height,
        edge_clamped,
    }
}

/// Crop an image to specified dimensions
pub fn crop_image(img: &RgbImage, rect: &CropRect) -> Result<RgbImage> {
    let (img_width, img_height) = img.dimensions();

    if rect.x + rect.width > img_width || rect.y + rect.height > img_height {
        return Err(anyhow::anyhow!(
            "Crop dimensions exceed image bounds: crop({},{},{}x{}) on {}x{} image",
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            img_width,
            img_height
        ));
    }

    Ok(imageops::crop_imm(img, rect.x, rect.y, rect.width, rect.height).to_image())
}

/// Shrink an image so its longest edge is at most `max_edge`
///
/// Images already within the limit are returned unchanged.
pub fn downscale_to_fit(img: &RgbImage, max_edge: u32) -> Result<RgbImage> {
    let (width, height) = img.dimensions();
    let longest = width.max(height);
    if longest <= max_edge || max_edge == 0 {
        return Ok(img.clone());
    }

    let scale = max_edge as f64 / longest as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    resize_image(img, new_width, new_height)
}

/// Resize an image to exact dimensions using high-quality algorithm
pub fn resize_image(img: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    let (src_width, src_height) = img.dimensions();

    if src_width == width && src_height == height {
        return Ok(img.clone());
    }

    let src_width_nz = NonZeroU32::new(src_width).ok_or_else(|| anyhow::anyhow!("Source width is zero"))?;
    let src_height_nz = NonZeroU32::new(src_height).ok_or_else(|| anyhow::anyhow!("Source height is zero"))?;
    let dst_width_nz = NonZeroU32::new(width).ok_or_else(|| anyhow::anyhow!("Target width is zero"))?;
    let dst_height_nz = NonZeroU32::new(height).ok_or_else(|| anyhow::anyhow!("Target height is zero"))?;

    let src_image = Image::from_vec_u8(
        src_width_nz.into(),
        src_height_nz.into(),
        img.as_raw().clone(),
        fast_image_resize::PixelType::U8x3,
    )?;

    let mut dst_image = Image::new(
        dst_width_nz.into(),
        dst_height_nz.into(),
        fast_image_resize::PixelType::U8x3,
    );

    let mut resizer = Resizer::new();
    resizer.resize(&src_image, &mut dst_image, Some(&ResizeOptions::default()))?;

    ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, dst_image.buffer().to_vec())
        .ok_or_else(|| anyhow::anyhow!("Resized buffer does not match {}x{}", width, height))
}
