//! JSON envelopes for the bidirectional streaming endpoint
//!
//! Outbound messages are externally tagged: `{"setup": {...}}` for the
//! one-time handshake and `{"realtime_input": {...}}` for media chunks.
//! Inbound messages are probed leniently: synthesized audio lives under
//! `serverContent.modelDraft.inlineData.data` and every other shape is
//! ignored so new server fields never break the bridge.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::frame::EncodedChunk;

/// One-time handshake announcing stream parameters.
#[derive(Debug, Clone, Serialize)]
pub struct Setup {
    pub model: String,
}

/// A batch of media chunks for the endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedChunk>,
}

/// Everything the bridge ever writes to the endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(model: impl Into<String>) -> Self {
        ClientMessage::Setup(Setup {
            model: model.into(),
        })
    }

    pub fn media(chunk: EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize client message")
    }
}

/// Pull the base64 audio payload out of an inbound message, if present.
pub fn extract_audio_b64(message: &Value) -> Option<&str> {
    message
        .get("serverContent")?
        .get("modelDraft")?
        .get("inlineData")?
        .get("data")?
        .as_str()
}

/// Decode the base64 audio payload of an inbound message.
pub fn decode_audio(b64: &str) -> Result<Bytes> {
    let pcm = general_purpose::STANDARD
        .decode(b64)
        .context("invalid base64 audio payload")?;
    Ok(Bytes::from(pcm))
}
