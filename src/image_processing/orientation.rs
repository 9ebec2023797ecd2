use anyhow::{Context, Result};
use exif::{In, Reader, Tag};
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Transform that brings stored pixels into display orientation
///
/// Named after what has to be done to the stored image, one per EXIF
/// orientation value 1 to 8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Normal,
    MirrorHorizontal,
    Rotate180,
    MirrorVertical,
    /// Mirror along the top-left to bottom-right diagonal
    Transpose,
    Rotate90,
    /// Mirror along the top-right to bottom-left diagonal
    Transverse,
    Rotate270,
}

impl Orientation {
    /// Map an EXIF orientation value; unknown values mean no transform
    pub fn from_exif(value: u32) -> Self {
        match value {
            2 => Self::MirrorHorizontal,
            3 => Self::Rotate180,
            4 => Self::MirrorVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::Transverse,
            8 => Self::Rotate270,
            _ => Self::Normal,
        }
    }

    /// Display width and height are the stored ones swapped
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270)
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::Normal
    }

    /// Apply the transform, consuming the stored image
    pub fn apply(self, img: RgbImage) -> RgbImage {
        match self {
            Self::Normal => img,
            Self::MirrorHorizontal => imageops::flip_horizontal(&img),
            Self::Rotate180 => imageops::rotate180(&img),
            Self::MirrorVertical => imageops::flip_vertical(&img),
            Self::Transpose => imageops::flip_horizontal(&imageops::rotate90(&img)),
            Self::Rotate90 => imageops::rotate90(&img),
            Self::Transverse => imageops::flip_horizontal(&imageops::rotate270(&img)),
            Self::Rotate270 => imageops::rotate270(&img),
        }
    }
}

/// Orientation recorded in the file's primary EXIF directory
///
/// A file without EXIF has no rotation. An EXIF block that is present but
/// cannot be parsed is an error.
pub fn read_orientation(path: &Path) -> Result<Orientation> {
    let file = File::open(path).with_context(|| format!("Failed to open {} for EXIF", path.display()))?;
    let exif = match Reader::new().read_from_container(&mut BufReader::new(file)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(Orientation::Normal),
        Err(e) => return Err(e).with_context(|| format!("Unreadable EXIF in {}", path.display())),
    };

    Ok(exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(Orientation::from_exif)
        .unwrap_or_default())
}

/// Decoded image in display orientation
pub struct OrientedImage {
    pub image: RgbImage,
    pub orientation: Orientation,
    /// EXIF was present but unreadable, so no rotation was applied
    pub metadata_failed: bool,
}

/// Decode an image and bring it into display orientation
///
/// Unreadable metadata is treated as "no rotation"; only a decode failure
/// is an error.
pub fn load_oriented(path: &Path) -> Result<OrientedImage> {
    let stored = super::open_image(path)?.to_rgb8();

    let (orientation, metadata_failed) = match read_orientation(path) {
        Ok(orientation) => (orientation, false),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "Ignoring unreadable EXIF");
            (Orientation::Normal, true)
        }
    };

    Ok(OrientedImage {
        image: orientation.apply(stored),
        orientation,
        metadata_failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    #[test]
    fn test_from_exif_values() {
        assert_eq!(Orientation::from_exif(1), Orientation::Normal);
        assert_eq!(Orientation::from_exif(6), Orientation::Rotate90);
        assert_eq!(Orientation::from_exif(8), Orientation::Rotate270);
        assert_eq!(Orientation::from_exif(0), Orientation::Normal);
        assert_eq!(Orientation::from_exif(42), Orientation::Normal);
    }

    #[test]
    fn test_display_dimensions_for_every_value() {
        let img = gradient(40, 30);
        for value in 1..=8u32 {
            let orientation = Orientation::from_exif(value);
            let expected = if orientation.swaps_dimensions() { (30, 40) } else { (40, 30) };
            assert_eq!(orientation.apply(img.clone()).dimensions(), expected, "EXIF value {}", value);
        }
    }

    #[test]
    fn test_rotate90_moves_top_left_to_top_right() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        let rotated = Orientation::Rotate90.apply(img);
        assert_eq!(rotated.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_transpose_keeps_top_left() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([0, 255, 0]));
        let transposed = Orientation::Transpose.apply(img);
        assert_eq!(transposed.get_pixel(0, 0), &Rgb([0, 255, 0]));
    }

    #[test]
    fn test_load_oriented_without_exif() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        gradient(20, 10).save(&path).unwrap();

        let loaded = load_oriented(&path).unwrap();
        assert_eq!(loaded.image.dimensions(), (20, 10));
        assert!(loaded.orientation.is_identity());
        assert!(!loaded.metadata_failed);
    }

    #[test]
    fn test_corrupt_exif_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new(&mut jpeg)
            .encode_image(&gradient(20, 10))
            .unwrap();
        // APP1 segment announcing EXIF with a garbage TIFF header
        let app1: &[u8] = &[0xFF, 0xE1, 0x00, 0x10, b'E', b'x', b'i', b'f', 0, 0, b'X', b'X', 0, 0, 0, 0, 0, 0];
        let mut broken = jpeg[..2].to_vec();
        broken.extend_from_slice(app1);
        broken.extend_from_slice(&jpeg[2..]);
        std::fs::write(&path, broken).unwrap();

        assert!(read_orientation(&path).is_err());
        let loaded = load_oriented(&path).unwrap();
        assert!(loaded.metadata_failed);
        assert_eq!(loaded.orientation, Orientation::Normal);
        assert_eq!(loaded.image.dimensions(), (20, 10));
    }
}
