//! Face detection collaborator
//!
//! The filter only needs bounding regions and a scene-level flag; where
//! those come from (Cloud Vision, a local model, a fake in tests) is
//! behind the `FaceDetector` trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

/// A detected bounding box, in pixel coordinates of the analyzed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Outcome of a detection pass over one frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detection {
    /// Scene-level flag: sensitive content present somewhere in the frame
    pub detected: bool,
    /// Detector confidence in `detected`, 0.0 to 1.0
    pub confidence: f32,
    /// Zero or more bounding regions. May be empty even when `detected`
    /// is set (degraded detector, scene-level-only signal).
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl Detection {
    /// The fail-closed stand-in used when the detector errors or times
    /// out: detected, no usable boxes, so the whole frame gets blurred.
    pub fn assume_detected() -> Self {
        Self {
            detected: true,
            confidence: 0.0,
            regions: Vec::new(),
        }
    }

    pub fn clear() -> Self {
        Self::default()
    }
}

/// Detects regions that must be redacted before a frame leaves the process.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Analyze one JPEG-encoded frame.
    async fn detect(&self, jpeg: &[u8]) -> Result<Detection>;
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image_data: &'a str,
}

/// Detector backed by an HTTP vision service.
///
/// POSTs `{"image_data": "<base64 jpeg>"}` and expects a `Detection`-shaped
/// JSON response.
pub struct RestDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl RestDetector {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl FaceDetector for RestDetector {
    async fn detect(&self, jpeg: &[u8]) -> Result<Detection> {
        let body = DetectRequest {
            image_data: &general_purpose::STANDARD.encode(jpeg),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("vision service unreachable")?
            .error_for_status()
            .context("vision service rejected the frame")?;
        response
            .json::<Detection>()
            .await
            .context("malformed vision service response")
    }
}
