pub mod transport;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::image_processing::resize::downscale_to_fit;
pub use transport::{HttpTransport, Prediction, PredictionStatus, PredictionTransport};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response from remote service: {0}")]
    Parse(String),

    #[error("Prediction {id} {status}: {message}")]
    Prediction {
        id: String,
        status: PredictionStatus,
        message: String,
    },

    #[error("Prediction {id} did not finish after {polls} polls")]
    Timeout { id: String, polls: u32 },

    #[error("Prediction {0} succeeded without an output URL")]
    MissingOutput(String),

    #[error("Failed to prepare {path}: {message}")]
    Image { path: PathBuf, message: String },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Model identifiers, `owner/name` or `owner/name:version`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteModels {
    pub face_restoration: String,
    pub skin_smoothing: String,
    pub upscale: String,
    pub background_removal: String,
}

impl Default for RemoteModels {
    fn default() -> Self {
        Self {
            face_restoration: "sczhou/codeformer".to_string(),
            skin_smoothing: "tencentarc/gfpgan".to_string(),
            upscale: "nightmareai/real-esrgan".to_string(),
            background_removal: "cjwbw/rembg".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteSettings {
    pub base_url: String,
    pub models: RemoteModels,
    /// Minimum spacing between two submissions
    pub min_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    /// Longest edge sent to the service; larger inputs are downscaled first
    pub max_dimension: u32,
    pub request_timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.replicate.com".to_string(),
            models: RemoteModels::default(),
            min_interval_ms: 2000,
            poll_interval_ms: 2000,
            max_polls: 150,
            max_dimension: 2048,
            request_timeout_secs: 120,
        }
    }
}

impl RemoteSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Rate-limited client for submit-then-poll enhancement jobs
///
/// Holds the instant of its last submission and waits out the remaining
/// interval before the next one. Methods take `&mut self`, so one client is
/// used sequentially; the pipeline creates one per job.
pub struct RemoteClient<'a, T> {
    transport: &'a T,
    token: String,
    settings: &'a RemoteSettings,
    last_submission: Option<Instant>,
}

impl<'a, T: PredictionTransport> RemoteClient<'a, T> {
    pub fn new(transport: &'a T, token: impl Into<String>, settings: &'a RemoteSettings) -> Self {
        Self {
            transport,
            token: token.into(),
            settings,
            last_submission: None,
        }
    }

    /// CodeFormer face restoration; lower fidelity means stronger restoration
    pub async fn restore_face(&mut self, image: &Path, fidelity: f32) -> Result<String, RemoteError> {
        let mut params = Map::new();
        params.insert("codeformer_fidelity".into(), json!(fidelity));
        params.insert("upscale".into(), json!(1));
        params.insert("face_upsample".into(), json!(true));
        params.insert("background_enhance".into(), json!(false));
        let model = self.settings.models.face_restoration.clone();
        self.run_model(&model, "image", image, params).await
    }

    pub async fn smooth_skin(&mut self, image: &Path, weight: f32) -> Result<String, RemoteError> {
        let mut params = Map::new();
        params.insert("scale".into(), json!(1));
        params.insert("version".into(), json!("v1.4"));
        params.insert("weight".into(), json!(weight));
        let model = self.settings.models.skin_smoothing.clone();
        self.run_model(&model, "img", image, params).await
    }

    pub async fn upscale(&mut self, image: &Path, scale: u32) -> Result<String, RemoteError> {
        let mut params = Map::new();
        params.insert("scale".into(), json!(scale));
        params.insert("face_enhance".into(), json!(false));
        let model = self.settings.models.upscale.clone();
        self.run_model(&model, "image", image, params).await
    }

    pub async fn remove_background(&mut self, image: &Path) -> Result<String, RemoteError> {
        let model = self.settings.models.background_removal.clone();
        self.run_model(&model, "image", image, Map::new()).await
    }

    /// Fetch a result and write it to `dest`
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
        let bytes = match url.strip_prefix("data:") {
            Some(data_uri) => decode_data_uri(data_uri)?,
            None => self.transport.fetch(url).await?,
        };
        tokio::fs::write(dest, &bytes).await.map_err(|source| RemoteError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        tracing::debug!(dest = %dest.display(), bytes = bytes.len(), "Downloaded remote result");
        Ok(())
    }

    async fn run_model(
        &mut self,
        model: &str,
        image_key: &str,
        image: &Path,
        mut params: Map<String, Value>,
    ) -> Result<String, RemoteError> {
        let path = image.to_path_buf();
        let max_dimension = self.settings.max_dimension;
        let data_uri = tokio::task::spawn_blocking(move || encode_data_uri(&path, max_dimension))
            .await
            .map_err(|e| RemoteError::Image {
                path: image.to_path_buf(),
                message: e.to_string(),
            })??;
        params.insert(image_key.to_string(), Value::String(data_uri));

        self.throttle().await;
        let prediction = self.transport.create(&self.token, model, Value::Object(params)).await?;
        tracing::info!(model, prediction_id = %prediction.id, "Submitted prediction");

        self.wait_for(prediction).await
    }

    async fn throttle(&mut self) {
        if let Some(last) = self.last_submission {
            let elapsed = last.elapsed();
            let interval = self.settings.min_interval();
            if elapsed < interval {
                tracing::debug!(wait_ms = (interval - elapsed).as_millis() as u64, "Rate limiting submission");
                sleep(interval - elapsed).await;
            }
        }
        self.last_submission = Some(Instant::now());
    }

    async fn wait_for(&self, mut prediction: Prediction) -> Result<String, RemoteError> {
        let mut polls = 0;
        while !prediction.status.is_terminal() {
            if polls >= self.settings.max_polls {
                return Err(RemoteError::Timeout {
                    id: prediction.id,
                    polls,
                });
            }
            sleep(self.settings.poll_interval()).await;
            polls += 1;
            prediction = self.transport.get(&self.token, &prediction.urls.get).await?;
            tracing::trace!(prediction_id = %prediction.id, status = %prediction.status, polls, "Polled prediction");
        }

        match prediction.status {
            PredictionStatus::Succeeded => prediction
                .output_url()
                .ok_or(RemoteError::MissingOutput(prediction.id)),
            status => Err(RemoteError::Prediction {
                message: prediction.error_message(),
                id: prediction.id,
                status,
            }),
        }
    }
}

/// Read an image as a `data:` URI, downscaling it when an edge exceeds `max_dimension`
pub fn encode_data_uri(path: &Path, max_dimension: u32) -> Result<String, RemoteError> {
    let image_error = |message: String| RemoteError::Image {
        path: path.to_path_buf(),
        message,
    };

    let bytes = std::fs::read(path).map_err(|e| image_error(e.to_string()))?;
    let reader = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|e| image_error(e.to_string()))?;
    let format = reader.format();
    let (width, height) = reader.into_dimensions().map_err(|e| image_error(e.to_string()))?;

    let engine = base64::engine::general_purpose::STANDARD;
    if width <= max_dimension && height <= max_dimension {
        let mime = match format {
            Some(ImageFormat::Png) => "image/png",
            Some(ImageFormat::WebP) => "image/webp",
            _ => "image/jpeg",
        };
        return Ok(format!("data:{};base64,{}", mime, engine.encode(&bytes)));
    }

    let img = image::load_from_memory(&bytes)
        .map_err(|e| image_error(e.to_string()))?
        .to_rgb8();
    let small = downscale_to_fit(&img, max_dimension).map_err(|e| image_error(e.to_string()))?;
    tracing::debug!(
        path = %path.display(),
        from = ?(width, height),
        to = ?small.dimensions(),
        "Downscaled image before upload"
    );

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 95)
        .encode_image(&small)
        .map_err(|e| image_error(e.to_string()))?;
    Ok(format!("data:image/jpeg;base64,{}", engine.encode(&buf)))
}

fn decode_data_uri(data_uri: &str) -> Result<Vec<u8>, RemoteError> {
    let (_, payload) = data_uri
        .split_once(";base64,")
        .ok_or_else(|| RemoteError::Parse("data URI without base64 payload".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| RemoteError::Parse(format!("invalid base64 in data URI: {}", e)))
}
