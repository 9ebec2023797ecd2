use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};
use imageproc::gradients::sobel_gradients;
use serde::{Deserialize, Serialize};

use super::FramingConstants;

/// Axis aligned rectangle in display-space pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Where a saliency detector should look and how big a window it should return
#[derive(Debug, Clone, Copy)]
pub struct SaliencyRequest {
    pub search: Region,
    /// Side of the square window to propose
    pub window: u32,
}

/// Generic "most interesting sub-rectangle" primitive
///
/// Used as a stand-in for a face detector: callers constrain the search to
/// where a face usually sits and read the returned window as a face box.
pub trait SaliencyDetector: Send + Sync {
    fn detect(&self, img: &RgbImage, request: &SaliencyRequest) -> Result<Region>;
}

/// Detection result shared by all variants of a job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceGeometry {
    pub image_width: u32,
    pub image_height: u32,
    pub face_x: f64,
    pub face_y: f64,
    pub face_height: f64,
    /// Raw detector output
    pub region: Region,
    /// True when the detector failed and a centered guess was used
    pub fallback: bool,
}

impl FaceGeometry {
    fn from_region(img_w: u32, img_h: u32, region: Region, framing: &FramingConstants, fallback: bool) -> Self {
        let (face_x, face_y) = region.center();
        Self {
            image_width: img_w,
            image_height: img_h,
            face_x,
            face_y,
            face_height: region.width as f64 * framing.face_height_ratio,
            region,
            fallback,
        }
    }
}

/// Build the constrained request for an image of the given size
pub fn face_search_request(width: u32, height: u32, framing: &FramingConstants) -> SaliencyRequest {
    let shorter = width.min(height) as f64;
    let window = ((shorter * framing.window_fraction).round() as u32).clamp(1, width.min(height).max(1));

    let x0 = (width as f64 * framing.search_left).floor() as u32;
    let x1 = ((width as f64 * framing.search_right).ceil() as u32).min(width);
    let y0 = (height as f64 * framing.search_top).floor() as u32;
    let y1 = ((height as f64 * framing.search_bottom).ceil() as u32).min(height);

    SaliencyRequest {
        search: Region {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0).max(1),
            height: y1.saturating_sub(y0).max(1),
        },
        window,
    }
}

/// Estimate face position and size from a saliency detector
///
/// A detector failure never aborts: the window is centered in the search
/// area instead and the geometry is flagged as a fallback.
pub fn estimate_face(
    img: &RgbImage,
    detector: &dyn SaliencyDetector,
    framing: &FramingConstants,
) -> FaceGeometry {
    let (width, height) = img.dimensions();
    let request = face_search_request(width, height, framing);

    match detector.detect(img, &request) {
        Ok(region) => FaceGeometry::from_region(width, height, region, framing, false),
        Err(e) => {
            tracing::warn!(error = %e, "Saliency detection failed, assuming a centered face");
            let region = centered_window(width, height, &request);
            FaceGeometry::from_region(width, height, region, framing, true)
        }
    }
}

fn centered_window(width: u32, height: u32, request: &SaliencyRequest) -> Region {
    let side = request.window.min(width).min(height).max(1);
    let (cx, cy) = request.search.center();
    let x = (cx - side as f64 / 2.0).round().clamp(0.0, (width - side) as f64) as u32;
    let y = (cy - side as f64 / 2.0).round().clamp(0.0, (height - side) as f64) as u32;
    Region {
        x,
        y,
        width: side,
        height: side,
    }
}

/// Edge density saliency weighted towards skin tones
///
/// Works on a downsampled copy: Sobel gradient magnitude, boosted where the
/// pixel falls inside a YCbCr skin range, summed with an integral image so
/// every candidate window costs four lookups.
#[derive(Debug, Clone)]
pub struct EdgeSaliency {
    /// Longest edge of the analysis copy
    pub analysis_edge: u32,
    /// Multiplier applied to gradients on skin-colored pixels
    pub skin_weight: u64,
}

impl Default for EdgeSaliency {
    fn default() -> Self {
        Self {
            analysis_edge: 512,
            skin_weight: 4,
        }
    }
}

impl SaliencyDetector for EdgeSaliency {
    fn detect(&self, img: &RgbImage, request: &SaliencyRequest) -> Result<Region> {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("Cannot run saliency on an empty image"));
        }

        let scale = (self.analysis_edge as f64 / width.max(height) as f64).min(1.0);
        let sw = ((width as f64 * scale).round() as u32).max(1);
        let sh = ((height as f64 * scale).round() as u32).max(1);
        let small = if scale < 1.0 {
            imageops::thumbnail(img, sw, sh)
        } else {
            img.clone()
        };

        let gray = imageops::grayscale(&small);
        let gradients = sobel_gradients(&gray);

        // Summed-area table with a zero row and column
        let stride = (sw + 1) as usize;
        let mut integral = vec![0u64; stride * (sh + 1) as usize];
        for y in 0..sh {
            let mut row_sum = 0u64;
            for x in 0..sw {
                let magnitude = gradients.get_pixel(x, y)[0] as u64;
                let weight = if is_skin_tone(small.get_pixel(x, y).0) {
                    self.skin_weight
                } else {
                    1
                };
                row_sum += magnitude * weight;
                let idx = (y as usize + 1) * stride + x as usize + 1;
                integral[idx] = integral[idx - stride] + row_sum;
            }
        }

        let window = ((request.window as f64 * scale).round() as u32).clamp(1, sw.min(sh));
        let sx0 = ((request.search.x as f64 * scale).floor() as u32).min(sw - window);
        let sy0 = ((request.search.y as f64 * scale).floor() as u32).min(sh - window);
        let sx1 = (((request.search.x + request.search.width) as f64 * scale).ceil() as u32)
            .clamp(sx0 + window, sw);
        let sy1 = (((request.search.y + request.search.height) as f64 * scale).ceil() as u32)
            .clamp(sy0 + window, sh);

        let step = (window / 8).max(1);
        let search_cx = (sx0 + sx1) as f64 / 2.0;
        let search_cy = (sy0 + sy1) as f64 / 2.0;

        let window_sum = |x: u32, y: u32| -> u64 {
            let (x0, y0) = (x as usize, y as usize);
            let (x1, y1) = (x0 + window as usize, y0 + window as usize);
            integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0]
        };

        let mut best: Option<(u64, f64, u32, u32)> = None;
        let mut y = sy0;
        while y + window <= sy1 {
            let mut x = sx0;
            while x + window <= sx1 {
                let score = window_sum(x, y);
                let dx = x as f64 + window as f64 / 2.0 - search_cx;
                let dy = y as f64 + window as f64 / 2.0 - search_cy;
                let distance = dx * dx + dy * dy;
                let better = match best {
                    None => true,
                    Some((best_score, best_distance, _, _)) => {
                        score > best_score || (score == best_score && distance < best_distance)
                    }
                };
                if better {
                    best = Some((score, distance, x, y));
                }
                x += step;
            }
            y += step;
        }

        let (_, _, bx, by) = best.ok_or_else(|| anyhow!("Search area smaller than the saliency window"))?;

        let side = ((window as f64 / scale).round() as u32).clamp(1, width.min(height));
        let x = ((bx as f64 / scale).round() as u32).min(width - side);
        let y = ((by as f64 / scale).round() as u32).min(height - side);

        Ok(Region {
            x,
            y,
            width: side,
            height: side,
        })
    }
}

/// Chroma-only skin test in YCbCr (BT.601)
fn is_skin_tone(rgb: [u8; 3]) -> bool {
    let r = rgb[0] as f32;
    let g = rgb[1] as f32;
    let b = rgb[2] as f32;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}
