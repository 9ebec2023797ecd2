use image::{imageops, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Tunables for the automatic color pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColorSettings {
    /// Longest edge of the copy used for statistics
    pub sample_edge: u32,
    /// Share of brightest pixels treated as the highlight sample
    pub highlight_fraction: f32,
    /// Highlight luminance above which the scene counts as a bright backdrop
    pub bright_threshold: f32,
    /// Maximum per-channel correction for bright backdrops
    pub bright_limit: f32,
    /// Maximum per-channel correction otherwise
    pub normal_limit: f32,
    pub saturation: f32,
    pub brightness: i32,
    pub sharpen_sigma: f32,
    pub sharpen_threshold: i32,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            sample_edge: 256,
            highlight_fraction: 0.10,
            bright_threshold: 235.0,
            bright_limit: 0.05,
            normal_limit: 0.15,
            saturation: 1.05,
            brightness: 4,
            sharpen_sigma: 1.2,
            sharpen_threshold: 3,
        }
    }
}

/// 3x3 linear color transform applied per pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix(pub [[f32; 3]; 3]);

impl ColorMatrix {
    pub fn identity() -> Self {
        Self::diagonal([1.0, 1.0, 1.0])
    }

    /// Per-channel gains, off-diagonal terms zero
    pub fn diagonal(gains: [f32; 3]) -> Self {
        ColorMatrix([
            [gains[0], 0.0, 0.0],
            [0.0, gains[1], 0.0],
            [0.0, 0.0, gains[2]],
        ])
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn apply(&self, img: &mut RgbImage) {
        if self.is_identity() {
            return;
        }
        let m = &self.0;
        for pixel in img.pixels_mut() {
            let src = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            for (c, row) in m.iter().enumerate() {
                let v = row[0] * src[0] + row[1] * src[1] + row[2] * src[2];
                pixel[c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Result of the highlight based white balance estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WhiteBalance {
    /// R, G, B multipliers
    pub gains: [f32; 3],
    /// Mean luminance of the highlight sample (0-255)
    pub highlight_luminance: f32,
    /// Clamp band that was applied to the gains
    pub limit: f32,
}

impl WhiteBalance {
    pub fn neutral() -> Self {
        Self {
            gains: [1.0, 1.0, 1.0],
            highlight_luminance: 0.0,
            limit: 0.0,
        }
    }

    pub fn matrix(&self) -> ColorMatrix {
        ColorMatrix::diagonal(self.gains)
    }
}

fn luminance(p: &Rgb<u8>) -> f32 {
    0.2126 * p[0] as f32 + 0.7152 * p[1] as f32 + 0.0722 * p[2] as f32
}

/// Estimate white balance gains from the brightest pixels
///
/// Takes the top decile by luminance of a downsampled copy, averages its
/// channels and derives gains that would make that average neutral. Gains
/// are clamped to a narrow band when the highlights are already near white
/// (studio backdrop) and a wider band otherwise.
pub fn estimate_white_balance(img: &RgbImage, settings: &ColorSettings) -> WhiteBalance {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return WhiteBalance::neutral();
    }

    let scale = (settings.sample_edge as f32 / width.max(height) as f32).min(1.0);
    let sample = if scale < 1.0 {
        let sw = ((width as f32 * scale).round() as u32).max(1);
        let sh = ((height as f32 * scale).round() as u32).max(1);
        imageops::thumbnail(img, sw, sh)
    } else {
        img.clone()
    };

    let mut pixels: Vec<(f32, [u8; 3])> = sample.pixels().map(|p| (luminance(p), p.0)).collect();
    pixels.sort_by(|a, b| b.0.total_cmp(&a.0));

    let count = ((pixels.len() as f32 * settings.highlight_fraction).round() as usize).clamp(1, pixels.len());
    let highlights = &pixels[..count];

    let mut sums = [0f64; 3];
    let mut lum_sum = 0f64;
    for (lum, rgb) in highlights {
        lum_sum += *lum as f64;
        for c in 0..3 {
            sums[c] += rgb[c] as f64;
        }
    }
    let n = count as f64;
    let avg = [sums[0] / n, sums[1] / n, sums[2] / n];
    let highlight_luminance = (lum_sum / n) as f32;

    let limit = if highlight_luminance > settings.bright_threshold {
        settings.bright_limit
    } else {
        settings.normal_limit
    };

    let target = (avg[0] + avg[1] + avg[2]) / 3.0;
    let mut gains = [1.0f32; 3];
    for c in 0..3 {
        if avg[c] > 0.0 && target > 0.0 {
            gains[c] = ((target / avg[c]) as f32).clamp(1.0 - limit, 1.0 + limit);
        }
    }

    WhiteBalance {
        gains,
        highlight_luminance,
        limit,
    }
}

/// Apply saturation adjustment to enhance or reduce color intensity
/// factor > 1.0 increases saturation, factor < 1.0 decreases it
pub fn apply_saturation_adjustment(img: &mut RgbImage, factor: f32) {
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }

    for pixel in img.pixels_mut() {
        let (h, s, v) = rgb_to_hsv(pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
        let new_s = (s * factor).clamp(0.0, 1.0);
        let (r, g, b) = hsv_to_rgb(h, new_s, v);
        *pixel = Rgb([
            r.round().clamp(0.0, 255.0) as u8,
            g.round().clamp(0.0, 255.0) as u8,
            b.round().clamp(0.0, 255.0) as u8,
        ]);
    }
}

/// Convert RGB to HSV color space
fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let r = r / 255.0;
    let g = g / 255.0;
    let b = b / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };

    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}

/// Convert HSV to RGB color space
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r_prime, g_prime, b_prime) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    (
        (r_prime + m) * 255.0,
        (g_prime + m) * 255.0,
        (b_prime + m) * 255.0,
    )
}

/// Fixed cosmetic finish for portraits: saturation, brightness, unsharp mask
pub fn apply_portrait_finish(img: RgbImage, settings: &ColorSettings) -> RgbImage {
    let mut out = img;
    apply_saturation_adjustment(&mut out, settings.saturation);

    if settings.brightness != 0 {
        out = imageops::brighten(&out, settings.brightness);
    }

    if settings.sharpen_sigma > 0.0 {
        out = imageops::unsharpen(&out, settings.sharpen_sigma, settings.sharpen_threshold);
    }

    out
}

/// Full color pass: white balance followed by the portrait finish
pub fn correct_colors(img: RgbImage, balance: &WhiteBalance, settings: &ColorSettings) -> RgbImage {
    let mut out = img;
    balance.matrix().apply(&mut out);
    apply_portrait_finish(out, settings)
}
