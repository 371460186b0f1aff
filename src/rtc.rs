//! Peer-connection collaborator interface
//!
//! The bridge does not negotiate ICE/SDP itself; it consumes an already
//! wired peer connection through these traits. Implementations wrap a
//! real WebRTC stack; tests use in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::PlaybackTrack;
use crate::frame::{MediaFrame, MediaKind};

/// An SDP session description exchanged during negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "offer".into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "answer".into(),
        }
    }
}

/// Why an inbound track stopped producing frames.
///
/// `Ended` is a normal end-of-stream; `Failed` is a genuine fault. The
/// session logs them differently but both close the track's queue.
#[derive(Debug)]
pub enum TrackError {
    /// The peer ended the track normally
    Ended,
    /// The track failed mid-stream
    Failed(anyhow::Error),
}

impl std::fmt::Display for TrackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackError::Ended => write!(f, "track ended"),
            TrackError::Failed(e) => write!(f, "track failed: {e}"),
        }
    }
}

impl std::error::Error for TrackError {}

/// Pull handle over an inbound track's decoded frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next decoded frame, suspending until one arrives.
    async fn recv(&mut self) -> Result<MediaFrame, TrackError>;
}

/// Events surfaced by the peer connection after negotiation.
pub enum PeerEvent {
    /// An inbound track was observed
    Track {
        kind: MediaKind,
        source: Box<dyn FrameSource>,
    },
    /// The peer connection closed or failed
    Disconnected,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Track { kind, .. } => f.debug_struct("Track").field("kind", kind).finish(),
            PeerEvent::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// One browser-facing real-time connection.
///
/// Lifecycle: `attach_playback` and `set_remote_offer` during session
/// setup, then `take_events` exactly once; `close` on teardown.
#[async_trait]
pub trait PeerConnection: Send {
    /// Apply the remote offer and produce the local answer.
    async fn set_remote_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Hand the peer the outbound audio track it should pull from.
    fn attach_playback(&mut self, track: PlaybackTrack);

    /// Take the event stream. Called once, after `set_remote_offer`.
    fn take_events(&mut self) -> mpsc::Receiver<PeerEvent>;

    /// Close the underlying connection. Idempotent.
    async fn close(&mut self);
}

/// Creates a peer connection per incoming offer.
///
/// The web layer holds one of these; the concrete WebRTC stack behind it
/// is supplied by the embedding application.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn PeerConnection>>;
}
