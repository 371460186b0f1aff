//! Privacy shield: face detection plus redaction
//!
//! Every video frame passes through [`FrameFilter::filter`] before it is
//! allowed to leave the process. The policy is fail-closed: when the
//! detector errors, times out, or reports a scene-level hit without
//! usable boxes, the whole frame is blurred. A frame is never forwarded
//! unfiltered after a detector failure.

pub mod blur;
pub mod detector;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use tracing::{debug, warn};

use crate::frame::{EncodedChunk, VideoFrame};

pub use blur::{blur_full, blur_regions, decode_image, encode_jpeg, mean_abs_diff};
pub use detector::{Detection, FaceDetector, Region, RestDetector};

/// What the filter did to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurApplied {
    /// Nothing detected, frame passed through unchanged
    None,
    /// Per-region blur over this many bounding boxes
    Regions(usize),
    /// Whole-frame blur (scene-level hit or detector failure)
    Full,
}

impl BlurApplied {
    pub fn is_blurred(&self) -> bool {
        !matches!(self, BlurApplied::None)
    }
}

/// Result of one filtering pass.
#[derive(Debug)]
pub struct FilterOutcome {
    pub frame: VideoFrame,
    pub blur: BlurApplied,
    /// What the detector reported, or the fail-closed stand-in when the
    /// detector call failed or timed out
    pub detection: Detection,
    /// True when the detector call itself failed and the fail-closed
    /// path was taken
    pub detector_failed: bool,
}

/// Stateless per-call privacy transform over decoded video frames.
pub struct FrameFilter {
    detector: Arc<dyn FaceDetector>,
    blur_sigma: f32,
    jpeg_quality: u8,
    detector_timeout: Duration,
}

impl FrameFilter {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        blur_sigma: f32,
        jpeg_quality: u8,
        detector_timeout: Duration,
    ) -> Self {
        Self {
            detector,
            blur_sigma,
            jpeg_quality,
            detector_timeout,
        }
    }

    /// Run detection and redaction over one frame.
    ///
    /// Errors only on malformed pixel buffers; the caller must drop the
    /// frame in that case. Detector failures never error; they blur.
    pub async fn filter(&self, frame: VideoFrame) -> Result<FilterOutcome> {
        let jpeg = blur::encode_jpeg(&frame, self.jpeg_quality)?;

        let (detection, detector_failed) = match tokio::time::timeout(
            self.detector_timeout,
            self.detector.detect(&jpeg),
        )
        .await
        {
            Ok(Ok(detection)) => (detection, false),
            Ok(Err(e)) => {
                warn!(error = %e, "detector failed, blurring whole frame");
                (Detection::assume_detected(), true)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.detector_timeout.as_millis() as u64,
                    "detector timed out, blurring whole frame"
                );
                (Detection::assume_detected(), true)
            }
        };

        let (frame, blur) = if !detection.regions.is_empty() {
            let redacted = blur::blur_regions(&frame, &detection.regions, self.blur_sigma)?;
            (redacted, BlurApplied::Regions(detection.regions.len()))
        } else if detection.detected {
            // Scene-level signal without boxes: blur everything
            let redacted = blur::blur_full(&frame, self.blur_sigma)?;
            (redacted, BlurApplied::Full)
        } else {
            (frame, BlurApplied::None)
        };

        debug!(?blur, confidence = detection.confidence, "frame filtered");
        Ok(FilterOutcome {
            frame,
            blur,
            detection,
            detector_failed,
        })
    }

    /// Filter a frame and serialize the result into its wire chunk form.
    pub async fn filter_encoded(&self, frame: VideoFrame) -> Result<EncodedChunk> {
        let outcome = self.filter(frame).await?;
        let jpeg = blur::encode_jpeg(&outcome.frame, self.jpeg_quality)?;
        Ok(EncodedChunk::jpeg(general_purpose::STANDARD.encode(jpeg)))
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }
}
