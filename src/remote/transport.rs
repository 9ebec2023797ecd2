use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

use super::RemoteError;

/// Lifecycle state reported by the inference service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    /// Any status this client does not know, treated as a failure
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled | Self::Unknown)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionUrls {
    pub get: String,
}

/// One remote job as returned by the create and get endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    pub urls: PredictionUrls,
}

impl Prediction {
    /// Result URL of a succeeded prediction (string output or first array item)
    pub fn output_url(&self) -> Option<String> {
        match self.output.as_ref()? {
            Value::String(url) => Some(url.clone()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
            _ => None,
        }
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) if !message.is_empty() => message.clone(),
            Some(Value::Null) | None => format!("prediction {}", self.status),
            Some(other) => other.to_string(),
        }
    }
}

/// HTTP seam under the remote client
///
/// `model` is either `owner/name` (latest version) or `owner/name:version`.
pub trait PredictionTransport: Send + Sync {
    fn create(&self, token: &str, model: &str, input: Value)
        -> impl Future<Output = Result<Prediction, RemoteError>> + Send;

    fn get(&self, token: &str, url: &str) -> impl Future<Output = Result<Prediction, RemoteError>> + Send;

    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, RemoteError>> + Send;
}

/// Replicate-style predictions API over `reqwest`
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("headshot-processor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn create_request(&self, model: &str, input: Value) -> (String, Value) {
        match model.split_once(':') {
            Some((_, version)) => (
                format!("{}/v1/predictions", self.base_url),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/v1/models/{}/predictions", self.base_url, model),
                json!({ "input": input }),
            ),
        }
    }

    async fn read_prediction(response: reqwest::Response) -> Result<Prediction, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| RemoteError::Parse(format!("{}: {}", e, text)))
    }
}

impl PredictionTransport for HttpTransport {
    async fn create(&self, token: &str, model: &str, input: Value) -> Result<Prediction, RemoteError> {
        let (url, body) = self.create_request(model, input);
        let response = self.http.post(&url).bearer_auth(token).json(&body).send().await?;
        Self::read_prediction(response).await
    }

    async fn get(&self, token: &str, url: &str) -> Result<Prediction, RemoteError> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Self::read_prediction(response).await
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: format!("download of {} failed", url),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
