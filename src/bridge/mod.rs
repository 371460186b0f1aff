//! Session bridge: peer tracks in, filtered media up, synthesized audio back
//!
//! Data flow for one session:
//!
//! ```text
//! peer video track ──▶ video pump ──▶ FrameFilter ──▶ video queue ─┐
//! peer audio track ──▶ audio pump ─────────────────▶ audio queue ─┤
//!                                                                 ▼
//!                                                          Uplink ──▶ endpoint
//!                                                        Downlink ◀── endpoint
//!                                                                 │
//! peer playback track ◀── PlaybackTrack ◀──── playback queue ◀────┘
//! ```

pub mod downlink;
pub mod session;
pub mod tracks;
pub mod uplink;

pub use downlink::{Downlink, DownlinkEnd};
pub use session::{BridgeConfig, CloseReason, Session, SessionHandle, SessionState};
pub use tracks::{audio_pump, video_pump, PlaybackTrack, PumpEnd};
pub use uplink::{Uplink, UplinkEnd};
