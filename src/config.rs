//! Process configuration from environment variables
//!
//! Built once at startup and passed by reference into session and web
//! construction; nothing in the crate reads the environment after this.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::bridge::BridgeConfig;

const DEFAULT_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "models/gemini-1.5-flash-8b-exp-0827";

#[derive(Debug, Clone)]
pub struct Settings {
    /// API key for the live endpoint (required to bridge, not to shield)
    pub live_api_key: Option<String>,
    /// Live endpoint URL without credentials
    pub live_url: String,
    pub model: String,
    /// HTTP face-detection service
    pub vision_url: Option<String>,
    pub blur_sigma: f32,
    pub max_face_count: usize,
    pub jpeg_quality: u8,
    pub audio_sample_rate: u32,
    pub video_fps: f32,
    /// Uplink bounded wait on the media queues
    pub frame_poll: Duration,
    pub detector_timeout: Duration,
    pub queue_capacity: usize,
    pub playback_grace: Duration,
    pub teardown_grace: Duration,
    pub forward_audio: bool,
    pub web_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            live_api_key: std::env::var("KASUMI_LIVE_API_KEY").ok(),
            live_url: std::env::var("KASUMI_LIVE_URL")
                .unwrap_or_else(|_| DEFAULT_LIVE_URL.to_string()),
            model: std::env::var("KASUMI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            vision_url: std::env::var("KASUMI_VISION_URL").ok(),
            blur_sigma: env_parse("KASUMI_BLUR_SIGMA", 15.0),
            max_face_count: env_parse("KASUMI_MAX_FACES", 3),
            jpeg_quality: env_parse("KASUMI_JPEG_QUALITY", 80),
            // A zero rate would break the playback timestamp math
            audio_sample_rate: match env_parse("KASUMI_AUDIO_SAMPLE_RATE", 16000) {
                0 => 16000,
                rate => rate,
            },
            video_fps: env_parse("KASUMI_VIDEO_FPS", 1.0),
            frame_poll: Duration::from_millis(env_parse("KASUMI_FRAME_POLL_MS", 500)),
            detector_timeout: Duration::from_millis(env_parse("KASUMI_DETECTOR_TIMEOUT_MS", 2000)),
            queue_capacity: env_parse("KASUMI_QUEUE_CAPACITY", 2),
            playback_grace: Duration::from_millis(env_parse("KASUMI_PLAYBACK_GRACE_MS", 100)),
            teardown_grace: Duration::from_secs(env_parse("KASUMI_TEARDOWN_GRACE_SECS", 5)),
            forward_audio: env_parse("KASUMI_FORWARD_AUDIO", true),
            web_port: env_parse("KASUMI_WEB_PORT", 8000),
        }
    }

    /// Full live endpoint URL with the API key attached.
    pub fn live_endpoint(&self) -> Result<String> {
        let Some(ref key) = self.live_api_key else {
            bail!("KASUMI_LIVE_API_KEY is not set");
        };
        Ok(format!("{}?key={}", self.live_url, key))
    }

    /// Per-session tunables derived from these settings.
    pub fn bridge_config(&self) -> BridgeConfig {
        let pacing = if self.video_fps > 0.0 {
            Duration::from_secs_f32(1.0 / self.video_fps)
        } else {
            Duration::ZERO
        };
        BridgeConfig {
            model: self.model.clone(),
            queue_capacity: self.queue_capacity,
            poll_window: self.frame_poll,
            frame_pacing: pacing,
            playback_grace: self.playback_grace,
            teardown_grace: self.teardown_grace,
            audio_sample_rate: self.audio_sample_rate,
            audio_channels: 1,
            forward_audio: self.forward_audio,
        }
    }
}
