use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use thiserror::Error;

use crate::utils::parse_hex_color;

/// One of the two output framings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// 4:5 framing, head and shoulders
    Portrait,
    /// 1:1 framing, tighter on the face
    Square,
}

impl Variant {
    /// Width divided by height of the emitted crop
    pub fn aspect_ratio(&self) -> f64 {
        match self {
            Variant::Portrait => 4.0 / 5.0,
            Variant::Square => 1.0,
        }
    }
}

/// Strength of a remote enhancement step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    #[default]
    #[value(name = "off")]
    Off,
    #[value(name = "low")]
    Low,
    #[value(name = "medium")]
    Medium,
    #[value(name = "high")]
    High,
}

impl Intensity {
    pub fn is_off(&self) -> bool {
        matches!(self, Intensity::Off)
    }

    /// CodeFormer fidelity weight. Lower values restore more aggressively.
    pub fn fidelity(&self) -> Option<f32> {
        match self {
            Intensity::Off => None,
            Intensity::Low => Some(0.9),
            Intensity::Medium => Some(0.7),
            Intensity::High => Some(0.5),
        }
    }

    /// Blend weight for the skin smoothing model
    pub fn smoothing_strength(&self) -> Option<f32> {
        match self {
            Intensity::Off => None,
            Intensity::Low => Some(0.3),
            Intensity::Medium => Some(0.5),
            Intensity::High => Some(0.7),
        }
    }
}

/// Upscale factor applied by the remote super-resolution model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Upscale {
    #[default]
    #[value(name = "off")]
    #[serde(rename = "off")]
    Off,
    #[value(name = "2x")]
    #[serde(rename = "2x")]
    X2,
    #[value(name = "4x")]
    #[serde(rename = "4x")]
    X4,
}

impl Upscale {
    pub fn factor(&self) -> Option<u32> {
        match self {
            Upscale::Off => None,
            Upscale::X2 => Some(2),
            Upscale::X4 => Some(4),
        }
    }
}

/// Enhancement settings snapshotted when a job starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhancementConfig {
    pub portrait: bool,
    pub square: bool,
    pub face_enhancement: Intensity,
    pub skin_smoothing: Intensity,
    pub upscale: Upscale,
    pub remove_background: bool,
    /// Solid color composited under the transparent result, `#RGB` or `#RRGGBB`
    pub background_color: Option<String>,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            portrait: true,
            square: true,
            face_enhancement: Intensity::Medium,
            skin_smoothing: Intensity::Off,
            upscale: Upscale::Off,
            remove_background: true,
            background_color: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one output variant (portrait or square) must be enabled")]
    NoVariants,

    #[error("invalid background color '{0}', expected #RGB or #RRGGBB")]
    BackgroundColor(String),
}

impl EnhancementConfig {
    /// Enabled variants in processing order
    pub fn variants(&self) -> Vec<Variant> {
        Variant::iter().filter(|v| self.is_enabled(*v)).collect()
    }

    pub fn is_enabled(&self, variant: Variant) -> bool {
        match variant {
            Variant::Portrait => self.portrait,
            Variant::Square => self.square,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.portrait && !self.square {
            return Err(ConfigError::NoVariants);
        }
        if let Some(color) = &self.background_color {
            if parse_hex_color(color).is_none() {
                return Err(ConfigError::BackgroundColor(color.clone()));
            }
        }
        Ok(())
    }

    /// Parsed background color, only meaningful when background removal runs
    pub fn background_rgb(&self) -> Option<[u8; 3]> {
        if !self.remove_background {
            return None;
        }
        self.background_color.as_deref().and_then(parse_hex_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_aspect_ratios() {
        assert_eq!(Variant::Square.aspect_ratio(), 1.0);
        assert!((Variant::Portrait.aspect_ratio() - 0.8).abs() < f64::EPSILON);
        assert_eq!(Variant::Portrait.to_string(), "portrait");
    }

    #[test]
    fn test_intensity_parameters() {
        assert_eq!(Intensity::Off.fidelity(), None);
        assert_eq!(Intensity::Medium.fidelity(), Some(0.7));
        assert!(Intensity::High.fidelity() < Intensity::Low.fidelity());
        assert_eq!(Intensity::High.smoothing_strength(), Some(0.7));
    }

    #[test]
    fn test_validate_rejects_no_variants() {
        let config = EnhancementConfig {
            portrait: false,
            square: false,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoVariants));
        assert!(config.variants().is_empty());
    }

    #[test]
    fn test_validate_background_color() {
        let mut config = EnhancementConfig {
            background_color: Some("#fff".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.background_rgb(), Some([255, 255, 255]));

        config.remove_background = false;
        assert_eq!(config.background_rgb(), None);

        config.background_color = Some("blue".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::BackgroundColor(_))));
    }

    #[test]
    fn test_config_deserializes_camel_case() {
        let json = r#"{"portrait": true, "square": false, "faceEnhancement": "high", "upscale": "2x"}"#;
        let config: EnhancementConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.face_enhancement, Intensity::High);
        assert_eq!(config.upscale, Upscale::X2);
        assert_eq!(config.variants(), vec![Variant::Portrait]);
        // Fields left out keep their defaults
        assert!(config.remove_background);
    }
}
