//! Media frame types flowing through the bridge

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// PCM audio samples
    Audio,
    /// Decoded video frames
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// A decoded video frame: tightly packed RGB8 pixels.
///
/// Immutable once produced; the privacy filter returns a new frame
/// rather than mutating in place.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw RGB8 pixel data, `width * height * 3` bytes
    pub pixels: Bytes,
    pub width: u32,
    pub height: u32,
    /// Timestamp in microseconds since stream start
    pub timestamp_us: u64,
}

impl VideoFrame {
    /// Create a frame from raw RGB8 pixels.
    ///
    /// Returns None if the buffer length does not match the dimensions.
    pub fn from_rgb8(pixels: Bytes, width: u32, height: u32, timestamp_us: u64) -> Option<Self> {
        if pixels.len() != (width as usize) * (height as usize) * 3 {
            return None;
        }
        Some(Self {
            pixels,
            width,
            height,
            timestamp_us,
        })
    }
}

/// A decoded audio frame: signed 16-bit little-endian PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw s16le PCM sample data
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub channels: u8,
    /// Timestamp in microseconds since stream start
    pub timestamp_us: u64,
}

impl AudioFrame {
    /// Number of samples per channel in this frame
    pub fn samples(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.pcm.len() / 2 / self.channels as usize
    }

    /// A frame of silence with the given duration
    pub fn silence(sample_rate: u32, channels: u8, duration_ms: u32, timestamp_us: u64) -> Self {
        let samples = (sample_rate as usize * duration_ms as usize) / 1000;
        Self {
            pcm: Bytes::from(vec![0u8; samples * 2 * channels as usize]),
            sample_rate,
            channels,
            timestamp_us,
        }
    }
}

/// A decoded unit of media pulled off an inbound peer track.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl MediaFrame {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaFrame::Audio(_) => MediaKind::Audio,
            MediaFrame::Video(_) => MediaKind::Video,
        }
    }
}

/// JPEG mime type for video chunks on the wire
pub const MIME_JPEG: &str = "image/jpeg";
/// Raw PCM mime type for audio chunks on the wire
pub const MIME_PCM: &str = "audio/pcm";

/// A frame serialized into its wire-ready form: a mime type plus
/// base64 payload. Consumed exactly once by the uplink writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

impl EncodedChunk {
    pub fn jpeg(data: String) -> Self {
        Self {
            mime_type: MIME_JPEG.to_string(),
            data,
        }
    }

    pub fn pcm(data: String) -> Self {
        Self {
            mime_type: MIME_PCM.to_string(),
            data,
        }
    }
}
