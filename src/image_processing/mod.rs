pub mod color_correction;
pub mod orientation;
pub mod raw_preview;
pub mod resize;
pub mod subject_detection;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::enhancement::Variant;
use color_correction::{estimate_white_balance, ColorSettings, WhiteBalance};
use resize::{compute_crop, crop_image, CropRect};
use subject_detection::{estimate_face, EdgeSaliency, FaceGeometry, SaliencyDetector};

/// JPEG quality for every file the engine writes
pub const JPEG_QUALITY: u8 = 95;

/// Framing heuristics layered on top of the saliency detector
///
/// These values were tuned by eye on studio headshots. They are not derived
/// from anything and are expected to be adjusted per studio setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FramingConstants {
    /// Face height as a multiple of the saliency window width
    pub face_height_ratio: f64,
    /// Crop height as a multiple of face height, portrait framing
    pub portrait_height_multiplier: f64,
    /// Crop height as a multiple of face height, square framing
    pub square_height_multiplier: f64,
    /// Face center distance from the crop top, as a share of crop height
    pub portrait_face_top: f64,
    pub square_face_top: f64,
    /// Saliency window side as a share of the shorter image edge
    pub window_fraction: f64,
    /// Search area bounds as shares of image width/height
    pub search_left: f64,
    pub search_right: f64,
    pub search_top: f64,
    pub search_bottom: f64,
}

impl Default for FramingConstants {
    fn default() -> Self {
        Self {
            face_height_ratio: 1.3,
            portrait_height_multiplier: 4.0,
            square_height_multiplier: 3.5,
            portrait_face_top: 0.30,
            square_face_top: 0.37,
            window_fraction: 0.22,
            search_left: 0.15,
            search_right: 0.85,
            search_top: 0.05,
            search_bottom: 0.65,
        }
    }
}

impl FramingConstants {
    pub fn height_multiplier(&self, variant: Variant) -> f64 {
        match variant {
            Variant::Portrait => self.portrait_height_multiplier,
            Variant::Square => self.square_height_multiplier,
        }
    }

    pub fn face_top_fraction(&self, variant: Variant) -> f64 {
        match variant {
            Variant::Portrait => self.portrait_face_top,
            Variant::Square => self.square_face_top,
        }
    }
}

/// Per-job analysis shared by every variant
#[derive(Debug, Clone, Copy)]
pub struct ImageAnalysis {
    pub geometry: FaceGeometry,
    pub white_balance: WhiteBalance,
}

/// Face-anchored cropping and color correction
pub struct CropEngine {
    detector: Box<dyn SaliencyDetector>,
    framing: FramingConstants,
    color: ColorSettings,
}

impl CropEngine {
    pub fn new(framing: FramingConstants, color: ColorSettings) -> Self {
        Self::with_detector(Box::new(EdgeSaliency::default()), framing, color)
    }

    pub fn with_detector(
        detector: Box<dyn SaliencyDetector>,
        framing: FramingConstants,
        color: ColorSettings,
    ) -> Self {
        Self {
            detector,
            framing,
            color,
        }
    }

    pub fn framing(&self) -> &FramingConstants {
        &self.framing
    }

    /// Detect the face and measure the white balance of a working image
    pub fn analyze(&self, path: &Path) -> Result<ImageAnalysis> {
        let loaded = orientation::load_oriented(path)?;
        let (img, orientation) = (&loaded.image, loaded.orientation);
        let geometry = estimate_face(img, self.detector.as_ref(), &self.framing);
        // Color correction is cosmetic; skip it when detection or metadata failed
        let white_balance = if geometry.fallback || loaded.metadata_failed {
            WhiteBalance::neutral()
        } else {
            estimate_white_balance(img, &self.color)
        };

        tracing::debug!(
            path = %path.display(),
            ?orientation,
            width = geometry.image_width,
            height = geometry.image_height,
            face_x = geometry.face_x,
            face_y = geometry.face_y,
            face_height = geometry.face_height,
            fallback = geometry.fallback,
            gains = ?white_balance.gains,
            "Analyzed working image"
        );

        Ok(ImageAnalysis {
            geometry,
            white_balance,
        })
    }

    /// Crop, color correct and encode one variant to `dest`
    pub fn render(&self, path: &Path, analysis: &ImageAnalysis, variant: Variant, dest: &Path) -> Result<CropRect> {
        let img = orientation::load_oriented(path)?.image;

        // Geometry is in display space; re-derive it if the decoded
        // dimensions disagree with what the analysis saw.
        let geometry = if img.dimensions() != (analysis.geometry.image_width, analysis.geometry.image_height) {
            tracing::warn!(
                path = %path.display(),
                expected = ?(analysis.geometry.image_width, analysis.geometry.image_height),
                actual = ?img.dimensions(),
                "Image dimensions changed since analysis, recomputing face geometry"
            );
            estimate_face(&img, self.detector.as_ref(), &self.framing)
        } else {
            analysis.geometry
        };

        let rect = compute_crop(&geometry, variant, &self.framing);
        if rect.edge_clamped {
            tracing::info!(%variant, ?rect, "Face near image edge, crop shifted to stay in bounds");
        }

        let cropped = crop_image(&img, &rect)?;
        let finished = color_correction::correct_colors(cropped, &analysis.white_balance, &self.color);
        save_jpeg(&finished, dest)?;

        Ok(rect)
    }
}

/// Decode an image, trusting its content over its extension
///
/// Remote results are saved under guessed extensions, so the format is
/// sniffed from the leading bytes.
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to read image: {}", path.display()))?
        .decode()
        .with_context(|| format!("Failed to decode image: {}", path.display()))
}

/// Encode an RGB image as a high quality JPEG
pub fn save_jpeg(img: &RgbImage, dest: &Path) -> Result<()> {
    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
    encoder
        .encode_image(img)
        .with_context(|| format!("Failed to encode JPEG: {}", dest.display()))?;
    Ok(())
}

/// Composite a transparent PNG over a solid color and save it as JPEG
pub fn flatten_onto_color(png_path: &Path, color: [u8; 3], dest: &Path) -> Result<()> {
    let rgba = open_image(png_path)?.to_rgba8();

    let (width, height) = rgba.dimensions();
    let flattened = RgbImage::from_fn(width, height, |x, y| {
        let p = rgba.get_pixel(x, y);
        let alpha = p[3] as f32 / 255.0;
        let blend = |c: usize| (p[c] as f32 * alpha + color[c] as f32 * (1.0 - alpha)).round() as u8;
        Rgb([blend(0), blend(1), blend(2)])
    });

    save_jpeg(&flattened, dest)
}

/// Re-encode a decodable image as JPEG, shrinking it to `max_edge` if needed
pub fn prepare_jpeg(src: &Path, dest: &Path, max_edge: u32) -> Result<()> {
    let img = open_image(src)?.to_rgb8();
    let img = resize::downscale_to_fit(&img, max_edge)?;
    save_jpeg(&img, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba, RgbaImage};

    fn create_portrait_photo(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let dx = x as i64 - width as i64 / 2;
            let dy = y as i64 - height as i64 / 3;
            if dx * dx + dy * dy <= 30 * 30 {
                if (x / 2 + y / 2) % 2 == 0 {
                    Rgb([224, 172, 140])
                } else {
                    Rgb([200, 150, 120])
                }
            } else {
                Rgb([235, 235, 240])
            }
        })
    }

    #[test]
    fn test_render_variants() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.png");
        create_portrait_photo(400, 500).save(&src).unwrap();

        let engine = CropEngine::new(FramingConstants::default(), ColorSettings::default());
        let analysis = engine.analyze(&src).unwrap();

        let square = dir.path().join("square.jpg");
        let rect = engine.render(&src, &analysis, Variant::Square, &square).unwrap();
        assert_eq!(rect.width, rect.height);
        let decoded = image::open(&square).unwrap();
        assert_eq!(decoded.width(), decoded.height());

        let portrait = dir.path().join("portrait.jpg");
        let rect = engine.render(&src, &analysis, Variant::Portrait, &portrait).unwrap();
        assert!(rect.x + rect.width <= 400 && rect.y + rect.height <= 500);
        let decoded = image::open(&portrait).unwrap();
        let ratio = decoded.width() as f64 / decoded.height() as f64;
        assert!((ratio - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_render_recomputes_geometry_on_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.png");
        create_portrait_photo(300, 300).save(&src).unwrap();

        let engine = CropEngine::new(FramingConstants::default(), ColorSettings::default());
        let mut analysis = engine.analyze(&src).unwrap();
        analysis.geometry.image_width = 4000;
        analysis.geometry.image_height = 6000;
        analysis.geometry.face_x = 3900.0;

        let dest = dir.path().join("out.jpg");
        let rect = engine.render(&src, &analysis, Variant::Square, &dest).unwrap();
        assert!(rect.x + rect.width <= 300);
        assert!(rect.y + rect.height <= 300);
    }

    use subject_detection::{Region, SaliencyRequest};

    struct BlindDetector;

    impl SaliencyDetector for BlindDetector {
        fn detect(&self, _img: &RgbImage, _request: &SaliencyRequest) -> Result<Region> {
            Err(anyhow::anyhow!("no salient region"))
        }
    }

    #[test]
    fn test_detector_failure_skips_white_balance() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("blue_cast.png");
        RgbImage::from_pixel(200, 250, Rgb([180, 190, 240])).save(&src).unwrap();

        let engine = CropEngine::with_detector(
            Box::new(BlindDetector),
            FramingConstants::default(),
            ColorSettings::default(),
        );
        let analysis = engine.analyze(&src).unwrap();
        assert!(analysis.geometry.fallback);
        assert_eq!(analysis.white_balance.gains, [1.0, 1.0, 1.0]);
        assert!(analysis.white_balance.matrix().is_identity());

        let dest = dir.path().join("square.jpg");
        let rect = engine.render(&src, &analysis, Variant::Square, &dest).unwrap();
        assert_eq!(rect.width, rect.height);
    }

    #[test]
    fn test_flatten_onto_color() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("cutout.png");
        let mut rgba = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        rgba.save(&png).unwrap();

        let dest = dir.path().join("flat.jpg");
        flatten_onto_color(&png, [0, 0, 255], &dest).unwrap();

        let flat = image::open(&dest).unwrap().to_rgb8();
        assert_eq!(flat.dimensions(), (8, 8));
        let corner = flat.get_pixel(7, 7);
        assert!(corner[2] > 200 && corner[0] < 60, "{:?}", corner);
    }
}
