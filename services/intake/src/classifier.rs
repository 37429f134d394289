//! Client for the remote trash classifier.
//!
//! The classifier is a separate HTTP service that downloads an image by URL and
//! returns a disposal category and target bin. It exposes:
//!
//! - `POST {base}/api/classify` with `{"image_url": ...}`
//! - `GET {base}/health` returning `{"status", "model_loaded", "device"}`

use crate::config::ClassifierConfig;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Classifier call errors
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to call classifier service: {0}")]
    Request(#[from] reqwest::Error),

    #[error("classifier service returned status {0}")]
    Status(u16),

    #[error("failed to decode classifier response: {0}")]
    Decode(String),

    #[error("classifier configuration error: {0}")]
    Config(String),
}

/// Outcome of a successful classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Disposal category, e.g. "plastic"
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_category: Option<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub bin_number: i32,
    pub bin_label: String,
    /// Human-readable result message
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    /// Whether the first-stage detector found an object
    #[serde(default, deserialize_with = "null_as_default")]
    pub l0_detected: bool,
    /// Label from the first-stage detector (bottle, cup, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l0_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l0_confidence: Option<f64>,
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Classifier port
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify the image at `image_url`
    async fn classify(&self, image_url: &str) -> Result<ClassificationResult, ClassifierError>;

    /// Liveness of the remote service
    async fn health(&self) -> Result<bool, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    image_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    model_loaded: bool,
    #[serde(default)]
    device: String,
}

impl HealthResponse {
    fn is_healthy(&self) -> bool {
        self.status == "ok" && self.model_loaded
    }
}

/// HTTP implementation of [`Classifier`]
pub struct HttpClassifier {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClassifierError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Build a client from configuration, or `None` when no classifier is configured
    pub fn from_config(config: &ClassifierConfig) -> Result<Option<Self>, ClassifierError> {
        let Some(base_url) = config.base_url() else {
            info!("No classifier configured, records will be stored unclassified");
            return Ok(None);
        };

        let client = Self::new(base_url, config.timeout())?;
        info!(
            base_url = %client.base_url,
            timeout_secs = config.timeout_secs,
            "Classifier client initialized"
        );
        Ok(Some(client))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[instrument(skip(self))]
    async fn classify(&self, image_url: &str) -> Result<ClassificationResult, ClassifierError> {
        let url = format!("{}/api/classify", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&ClassifyRequest { image_url })
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        let result = response
            .json::<ClassificationResult>()
            .await
            .map_err(|e| ClassifierError::Decode(e.to_string()))?;

        debug!(
            category = %result.category,
            confidence = result.confidence,
            bin_number = result.bin_number,
            "Classifier responded"
        );

        Ok(result)
    }

    async fn health(&self) -> Result<bool, ClassifierError> {
        let url = format!("{}/health", self.base_url);

        let response = self.http_client.get(&url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Ok(false);
        }

        let health = response
            .json::<HealthResponse>()
            .await
            .map_err(|e| ClassifierError::Decode(e.to_string()))?;

        debug!(status = %health.status, device = %health.device, "Classifier health");

        Ok(health.is_healthy())
    }
}
