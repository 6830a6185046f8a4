//! OCR collaborator client.
//!
//! The provider is a black box over HTTP: it receives raw file bytes and
//! answers with extracted text, per-page character offsets, and optional
//! embedded figure blobs. The client owns retry/backoff for transient
//! failures and a circuit breaker whose state is observable.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::chunker::PageOffset;
use crate::error::{io_err, PttsError, Result};
use crate::model::OcrMode;
use crate::retry::{with_retries, BreakerState, CircuitBreaker};

/// One figure reported by the provider, bytes still base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrImage {
    pub page: i64,
    pub index: i64,
    pub bbox: BoundingBox,
    pub format: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl OcrImage {
    pub fn decode_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| PttsError::validation(format!("image payload is not base64: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutput {
    pub request_id: String,
    pub text: String,
    pub page_count: i64,
    #[serde(default)]
    pub pages: Vec<PageOffset>,
    pub quality_score: Option<f64>,
    pub cost: Option<f64>,
    pub duration_ms: i64,
    #[serde(default)]
    pub blocks: Option<serde_json::Value>,
    #[serde(default)]
    pub images: Vec<OcrImage>,
}

#[async_trait]
pub trait OcrClient: Send + Sync {
    async fn process(
        &self,
        file_path: &Path,
        mode: OcrMode,
        max_pages: Option<u32>,
    ) -> Result<OcrOutput>;

    fn breaker_state(&self) -> BreakerState;

    /// Identity recorded into provenance `processor` fields.
    fn processor(&self) -> (&'static str, &'static str) {
        ("datalab-ocr", "1")
    }
}

pub struct DatalabClient {
    base_url: String,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl DatalabClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.into(),
            http,
            breaker: CircuitBreaker::new("datalab"),
        }
    }

    async fn submit(
        &self,
        bytes: &[u8],
        file_name: &str,
        mode: OcrMode,
        max_pages: Option<u32>,
    ) -> Result<OcrOutput> {
        let mut req = self
            .http
            .post(format!("{}/v1/ocr", self.base_url))
            .header("x-ocr-mode", mode.as_str())
            .header("x-file-name", file_name)
            .body(bytes.to_vec());
        if let Some(n) = max_pages {
            req = req.header("x-max-pages", n.to_string());
        }

        let resp = req.send().await.map_err(classify_reqwest("ocr"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status("ocr", status));
        }
        resp.json::<OcrOutput>()
            .await
            .map_err(|e| PttsError::ExternalUnavailable {
                operation: "ocr".to_string(),
                cause: format!("malformed response: {e}"),
            })
    }
}

#[async_trait]
impl OcrClient for DatalabClient {
    async fn process(
        &self,
        file_path: &Path,
        mode: OcrMode,
        max_pages: Option<u32>,
    ) -> Result<OcrOutput> {
        let bytes = std::fs::read(file_path).map_err(io_err(file_path))?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        with_retries(&self.breaker, "ocr", || {
            self.submit(&bytes, &file_name, mode, max_pages)
        })
        .await
    }

    fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}

/// Timeouts and connect failures are transient; everything else from the
/// transport layer is treated as unavailability.
pub(crate) fn classify_reqwest(operation: &str) -> impl FnOnce(reqwest::Error) -> PttsError + '_ {
    move |e| {
        if e.is_timeout() {
            PttsError::ExternalTimeout {
                operation: operation.to_string(),
            }
        } else {
            PttsError::ExternalUnavailable {
                operation: operation.to_string(),
                cause: e.to_string(),
            }
        }
    }
}

/// 5xx / 429 / 408 are retryable; other 4xx mean the request itself is bad
/// and retrying cannot help.
pub(crate) fn classify_status(operation: &str, status: reqwest::StatusCode) -> PttsError {
    let code = status.as_u16();
    if status.is_server_error() || code == 429 || code == 408 {
        PttsError::ExternalUnavailable {
            operation: operation.to_string(),
            cause: format!("status {code}"),
        }
    } else {
        PttsError::validation(format!("{operation} rejected the request: status {code}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_retry_policy() {
        assert!(classify_status("ocr", reqwest::StatusCode::INTERNAL_SERVER_ERROR).is_transient());
        assert!(classify_status("ocr", reqwest::StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(classify_status("ocr", reqwest::StatusCode::REQUEST_TIMEOUT).is_transient());
        assert!(!classify_status("ocr", reqwest::StatusCode::BAD_REQUEST).is_transient());
        assert!(!classify_status("ocr", reqwest::StatusCode::UNPROCESSABLE_ENTITY).is_transient());
    }

    #[test]
    fn image_payload_decodes_base64() {
        let img = OcrImage {
            page: 1,
            index: 0,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            },
            format: "png".into(),
            width: Some(10),
            height: Some(10),
            data: base64::engine::general_purpose::STANDARD.encode(b"fake-png"),
        };
        assert_eq!(img.decode_bytes().unwrap(), b"fake-png");

        let bad = OcrImage {
            data: "%%not-base64%%".into(),
            ..img
        };
        assert_eq!(bad.decode_bytes().unwrap_err().kind(), "VALIDATION_ERROR");
    }

    #[test]
    fn output_deserializes_with_optional_fields_absent() {
        let raw = r#"{
            "request_id": "req-1",
            "text": "Page one text",
            "page_count": 1,
            "duration_ms": 12,
            "quality_score": null,
            "cost": null
        }"#;
        let out: OcrOutput = serde_json::from_str(raw).unwrap();
        assert!(out.pages.is_empty());
        assert!(out.images.is_empty());
        assert!(out.blocks.is_none());
    }
}
