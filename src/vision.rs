//! Vision-language collaborator client: image in, description + confidence
//! out. Shares the retry/circuit discipline with the OCR client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, PttsError, Result};
use crate::ocr::{classify_reqwest, classify_status};
use crate::retry::{with_retries, BreakerState, CircuitBreaker};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionOutput {
    pub description: String,
    /// Model self-reported confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub structured_data: Option<serde_json::Value>,
    #[serde(default)]
    pub tokens_used: Option<i64>,
}

#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn describe(&self, image_path: &Path, format: &str) -> Result<VisionOutput>;

    fn breaker_state(&self) -> BreakerState;

    fn processor(&self) -> (&'static str, &'static str) {
        ("vlm-describe", "1")
    }
}

pub struct HttpVisionClient {
    base_url: String,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl HttpVisionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.into(),
            http,
            breaker: CircuitBreaker::new("vision"),
        }
    }

    async fn submit(&self, bytes: &[u8], format: &str) -> Result<VisionOutput> {
        let resp = self
            .http
            .post(format!("{}/v1/describe", self.base_url))
            .header("x-image-format", format)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(classify_reqwest("vision"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status("vision", status));
        }
        let out: VisionOutput =
            resp.json()
                .await
                .map_err(|e| PttsError::ExternalUnavailable {
                    operation: "vision".to_string(),
                    cause: format!("malformed response: {e}"),
                })?;
        if !(0.0..=1.0).contains(&out.confidence) {
            return Err(PttsError::validation(format!(
                "vision confidence {} outside [0, 1]",
                out.confidence
            )));
        }
        Ok(out)
    }
}

#[async_trait]
impl VisionClient for HttpVisionClient {
    async fn describe(&self, image_path: &Path, format: &str) -> Result<VisionOutput> {
        let bytes = std::fs::read(image_path).map_err(io_err(image_path))?;
        with_retries(&self.breaker, "vision", || self.submit(&bytes, format)).await
    }

    fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_deserializes_without_optionals() {
        let raw = r#"{ "description": "A bar chart of quarterly revenue", "confidence": 0.87 }"#;
        let out: VisionOutput = serde_json::from_str(raw).unwrap();
        assert!(out.structured_data.is_none());
        assert!(out.tokens_used.is_none());
        assert!((out.confidence - 0.87).abs() < 1e-9);
    }
}
