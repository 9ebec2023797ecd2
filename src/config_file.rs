use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::RunArgs;
use crate::enhancement::EnhancementConfig;
use crate::image_processing::color_correction::ColorSettings;
use crate::image_processing::FramingConstants;
use crate::pipeline::DEFAULT_UPSCALE_INPUT_MAX;
use crate::queue::SchedulerSettings;
use crate::remote::RemoteSettings;

/// Default queue file, relative to the working directory
pub const DEFAULT_QUEUE_FILE: &str = "headshot-queue.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub file: PathBuf,
    pub max_retries: u32,
    pub backoff_base_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_QUEUE_FILE),
            max_retries: 3,
            backoff_base_secs: 1.0,
        }
    }
}

impl QueueConfig {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_retries: self.max_retries.max(1),
            backoff_base: Duration::try_from_secs_f64(self.backoff_base_secs).unwrap_or(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Longest edge sent to the upscaler
    pub upscale_input_max: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upscale_input_max: DEFAULT_UPSCALE_INPUT_MAX,
        }
    }
}

/// Config file format; every section and field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub remote: RemoteSettings,
    pub enhancement: EnhancementConfig,
    pub pipeline: PipelineConfig,
    pub framing: FramingConstants,
    pub color: ColorSettings,
}

impl AppConfig {
    /// Load the config file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config
            .enhancement
            .validate()
            .with_context(|| format!("Invalid enhancement settings in {:?}", path))?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn set_queue_file(&mut self, file: Option<PathBuf>) {
        if let Some(file) = file {
            self.queue.file = file;
        }
    }

    /// Command-line flags take precedence over file values
    pub fn apply_run_args(&mut self, args: &RunArgs) {
        let enhancement = &mut self.enhancement;
        if let Some(face) = args.face {
            enhancement.face_enhancement = face;
        }
        if let Some(skin) = args.skin {
            enhancement.skin_smoothing = skin;
        }
        if let Some(upscale) = args.upscale {
            enhancement.upscale = upscale;
        }
        if args.no_portrait {
            enhancement.portrait = false;
        }
        if args.no_square {
            enhancement.square = false;
        }
        if args.no_background_removal {
            enhancement.remove_background = false;
        }
        if let Some(color) = &args.background_color {
            enhancement.background_color = Some(color.clone());
        }
        if let Some(max_retries) = args.max_retries {
            self.queue.max_retries = max_retries;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhancement::{Intensity, Upscale};

    #[test]
    fn test_missing_path_gives_defaults() {
        assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r##"{
                "queue": { "maxRetries": 5 },
                "remote": { "pollIntervalMs": 500, "models": { "upscale": "acme/esrgan:abc123" } },
                "enhancement": { "square": false, "skinSmoothing": "low", "upscale": "4x", "backgroundColor": "#fff" },
                "framing": { "squareFaceTop": 0.35 }
            }"##,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.file, PathBuf::from(DEFAULT_QUEUE_FILE));
        assert_eq!(config.remote.poll_interval_ms, 500);
        assert_eq!(config.remote.max_polls, 150);
        assert_eq!(config.remote.models.upscale, "acme/esrgan:abc123");
        assert_eq!(config.remote.models.face_restoration, "sczhou/codeformer");
        assert!(!config.enhancement.square);
        assert_eq!(config.enhancement.skin_smoothing, Intensity::Low);
        assert_eq!(config.enhancement.upscale, Upscale::X4);
        assert_eq!(config.framing.square_face_top, 0.35);
        assert_eq!(config.framing.portrait_face_top, 0.30);
    }

    #[test]
    fn test_invalid_enhancement_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "enhancement": { "portrait": false, "square": false } }"#).unwrap();
        assert!(AppConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_run_args_override_file() {
        let mut config = AppConfig::default();
        config.apply_run_args(&RunArgs {
            face: Some(Intensity::High),
            no_background_removal: true,
            max_retries: Some(1),
            ..RunArgs::default()
        });
        assert_eq!(config.enhancement.face_enhancement, Intensity::High);
        assert!(!config.enhancement.remove_background);
        assert_eq!(config.queue.scheduler_settings().max_retries, 1);
    }
}
