//! Kasumi - privacy-preserving bridge between browser sessions and a
//! generative live endpoint
//!
//! This crate provides everything needed to run a session bridge:
//! - Frame types: decoded video/audio frames and their wire chunk form
//! - Shield: face detection plus fail-closed redaction
//! - Queue: bounded latest-wins handoff between tracks and the uplink
//! - Live: endpoint connection and the bidirectional wire protocol
//! - Bridge: session lifecycle, uplink multiplexing, downlink demuxing
//! - Web: offer negotiation and the shield REST surface
//!
//! # Architecture
//!
//! A session runs three concerns under one cancellation scope:
//!
//! 1. **Track pumps** - pull frames from the peer, filter video through
//!    the shield, push into per-track queues
//! 2. **Uplink** - drains the queues fairly into one endpoint socket
//! 3. **Downlink** - extracts synthesized audio from endpoint messages
//!    and feeds the playback track
//!
//! # Example
//!
//! ```ignore
//! use kasumi::{FrameFilter, RestDetector, Session, Settings};
//!
//! let settings = kasumi::Settings::from_env()?;
//! let detector = Arc::new(RestDetector::new(vision_url));
//! let filter = Arc::new(FrameFilter::new(detector, 15.0, 80, timeout));
//!
//! let (answer, handle) = Session::connect(
//!     &settings.live_endpoint()?,
//!     peer,
//!     filter,
//!     settings.bridge_config(),
//!     offer,
//! )
//! .await?;
//! // ... later
//! handle.close().await;
//! ```

// Session lifecycle, uplink/downlink, track pumps
pub mod bridge;

// Environment-driven settings
pub mod config;

// Frame and chunk types
pub mod frame;

// Endpoint connection and wire protocol
pub mod live;

// Bounded latest-wins track queues
pub mod queue;

// Peer connection seams
pub mod rtc;

// Face detection and redaction
pub mod shield;

// HTTP surface
pub mod web;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// Frames
pub use frame::{AudioFrame, EncodedChunk, MediaFrame, MediaKind, VideoFrame};

// Queues
pub use queue::{QueueStats, TrackQueue};

// Shield
pub use shield::{BlurApplied, Detection, FaceDetector, FilterOutcome, FrameFilter, Region, RestDetector};

// Bridge
pub use bridge::{BridgeConfig, CloseReason, Session, SessionHandle, SessionState};

// Peer seams
pub use rtc::{FrameSource, PeerConnection, PeerEvent, PeerFactory, SessionDescription, TrackError};

// Settings
pub use config::Settings;
