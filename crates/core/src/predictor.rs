use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::types::{ImageId, PredictionLabel, PredictionResult, UploadedImage};

pub const HEALTH_PATH: &str = "health";
pub const PREDICT_PATH: &str = "predict";
pub const UPLOAD_FIELD: &str = "file";

/// Why a predictor call did not produce a usable answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictError {
    #[error("predictor returned HTTP {status}{}", detail_suffix(.detail))]
    Status { status: u16, detail: Option<String> },
    #[error("predictor request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("could not reach predictor: {0}")]
    Transport(String),
    #[error("invalid predictor response: {0}")]
    Decode(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(" ({detail})"),
        None => String::new(),
    }
}

/// Success body of `POST /predict`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictResponse {
    pub prediction: String,
    pub confidence: f64,
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl PredictResponse {
    pub fn into_result(self, image_id: ImageId) -> Result<PredictionResult, PredictError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(PredictError::Decode(format!(
                "confidence {} is outside [0, 1]",
                self.confidence
            )));
        }

        Ok(PredictionResult {
            image_id,
            label: PredictionLabel::from_wire(&self.prediction),
            confidence: self.confidence,
            threshold: self.threshold,
            received_at: Utc::now(),
        })
    }
}

/// The two predictor endpoints the workflow and the monitor depend on.
pub trait Predictor: Send + Sync + 'static {
    /// `GET /health`; any non-success outcome is an error.
    fn check_health(&self) -> impl Future<Output = Result<(), PredictError>> + Send;

    /// `POST /predict` with the image as multipart field `file`.
    fn predict(
        &self,
        image: UploadedImage,
    ) -> impl Future<Output = Result<PredictResponse, PredictError>> + Send;
}

/// reqwest-backed client for the remote predictor service.
#[derive(Debug, Clone)]
pub struct PredictorClient {
    base_url: Url,
    health_url: Url,
    predict_url: Url,
    predict_timeout: Duration,
    client: reqwest::Client,
}

impl PredictorClient {
    pub fn new(base_url: &str, predict_timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("invalid predictor base URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let health_url = base_url
            .join(HEALTH_PATH)
            .with_context(|| format!("failed to build URL for path: {HEALTH_PATH}"))?;
        let predict_url = base_url
            .join(PREDICT_PATH)
            .with_context(|| format!("failed to build URL for path: {PREDICT_PATH}"))?;

        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            health_url,
            predict_url,
            predict_timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn health_url(&self) -> &Url {
        &self.health_url
    }

    pub fn predict_url(&self) -> &Url {
        &self.predict_url
    }

    fn transport_error(&self, error: reqwest::Error) -> PredictError {
        if error.is_timeout() {
            PredictError::Timeout(self.predict_timeout)
        } else {
            PredictError::Transport(format!("{:#}", anyhow::Error::new(error)))
        }
    }
}

impl Predictor for PredictorClient {
    async fn check_health(&self) -> Result<(), PredictError> {
        let resp = self
            .client
            .get(self.health_url.clone())
            .send()
            .await
            .map_err(|e| PredictError::Transport(format!("{:#}", anyhow::Error::new(e))))?;

        if !resp.status().is_success() {
            return Err(PredictError::Status {
                status: resp.status().as_u16(),
                detail: None,
            });
        }

        Ok(())
    }

    async fn predict(&self, image: UploadedImage) -> Result<PredictResponse, PredictError> {
        let part = Part::bytes(image.bytes().to_vec())
            .file_name(image.file_name().to_string())
            .mime_str(image.mime_type())
            .map_err(|e| {
                PredictError::Transport(format!(
                    "invalid content type '{}': {e}",
                    image.mime_type()
                ))
            })?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let resp = self
            .client
            .post(self.predict_url.clone())
            .multipart(form)
            .timeout(self.predict_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(PredictError::Status {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        serde_json::from_slice::<PredictResponse>(&body)
            .map_err(|e| PredictError::Decode(e.to_string()))
    }
}

/// Extracts the `error` field the predictor puts in its failure bodies.
fn error_detail(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|detail| !detail.is_empty())
        .map(ToString::to_string)
}
