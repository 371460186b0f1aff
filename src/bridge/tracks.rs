//! Inbound track pumps and the outbound playback sink
//!
//! Each inbound peer track gets a pump task that pulls decoded frames,
//! runs video through the privacy filter, and pushes wire-ready chunks
//! onto its uplink queue. Closing the queue is the pump's only teardown
//! signal to the rest of the session.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{AudioFrame, EncodedChunk, MediaFrame};
use crate::queue::TrackQueue;
use crate::rtc::{FrameSource, TrackError};
use crate::shield::FrameFilter;

/// How a pump loop finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Track ended normally
    Ended,
    /// Track receive failed
    Failed,
    /// Session teardown cancelled the loop
    Cancelled,
}

/// Pull decoded video frames, filter each one, and enqueue the encoded
/// result. Always closes the queue on exit. Frames are paced to the
/// configured interval so the endpoint is not flooded.
pub async fn video_pump(
    mut source: Box<dyn FrameSource>,
    filter: Arc<FrameFilter>,
    queue: Arc<TrackQueue<EncodedChunk>>,
    pacing: Duration,
    cancel: CancellationToken,
) -> PumpEnd {
    let end = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            result = source.recv() => match result {
                Ok(frame) => frame,
                Err(TrackError::Ended) => {
                    info!("video track ended");
                    break PumpEnd::Ended;
                }
                Err(TrackError::Failed(e)) => {
                    warn!(error = %e, "video track failed");
                    break PumpEnd::Failed;
                }
            },
        };

        match frame {
            MediaFrame::Video(frame) => {
                // Every frame goes through the filter; a frame the filter
                // rejects is dropped, never forwarded raw.
                match filter.filter_encoded(frame).await {
                    Ok(chunk) => {
                        queue.push(chunk);
                    }
                    Err(e) => warn!(error = %e, "dropping unfilterable frame"),
                }
            }
            other => {
                debug!(kind = %other.kind(), "ignoring non-video frame on video track");
                continue;
            }
        }

        if !pacing.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break PumpEnd::Cancelled,
                _ = tokio::time::sleep(pacing) => {}
            }
        }
    };

    queue.close();
    end
}

/// Pull decoded audio frames and enqueue them as raw PCM chunks.
/// Always closes the queue on exit.
pub async fn audio_pump(
    mut source: Box<dyn FrameSource>,
    queue: Arc<TrackQueue<EncodedChunk>>,
    cancel: CancellationToken,
) -> PumpEnd {
    let end = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            result = source.recv() => match result {
                Ok(frame) => frame,
                Err(TrackError::Ended) => {
                    info!("audio track ended");
                    break PumpEnd::Ended;
                }
                Err(TrackError::Failed(e)) => {
                    warn!(error = %e, "audio track failed");
                    break PumpEnd::Failed;
                }
            },
        };

        match frame {
            MediaFrame::Audio(frame) => {
                let chunk = EncodedChunk::pcm(general_purpose::STANDARD.encode(&frame.pcm));
                queue.push(chunk);
            }
            other => {
                debug!(kind = %other.kind(), "ignoring non-audio frame on audio track");
            }
        }
    };

    queue.close();
    end
}

/// Outbound audio track fed by the downlink.
///
/// The peer connection's pull callback calls [`PlaybackTrack::next_frame`]
/// on its own cadence. When nothing has arrived within the grace period a
/// silence frame is synthesized so the callback cadence never stalls.
pub struct PlaybackTrack {
    queue: Arc<TrackQueue<Bytes>>,
    sample_rate: u32,
    channels: u8,
    grace: Duration,
    clock_us: u64,
}

impl PlaybackTrack {
    /// Duration of a synthesized silence frame
    const SILENCE_MS: u32 = 20;

    pub fn new(
        queue: Arc<TrackQueue<Bytes>>,
        sample_rate: u32,
        channels: u8,
        grace: Duration,
    ) -> Self {
        Self {
            queue,
            sample_rate,
            channels,
            grace,
            clock_us: 0,
        }
    }

    /// Produce the next outbound audio frame.
    ///
    /// Returns None once the session has closed the queue; until then a
    /// missing item within the grace period yields silence, not an error.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        let frame = match tokio::time::timeout(self.grace, self.queue.pop()).await {
            Ok(Some(pcm)) => AudioFrame {
                pcm,
                sample_rate: self.sample_rate,
                channels: self.channels,
                timestamp_us: self.clock_us,
            },
            Ok(None) => return None,
            Err(_) => AudioFrame::silence(
                self.sample_rate,
                self.channels,
                Self::SILENCE_MS,
                self.clock_us,
            ),
        };
        let samples = frame.samples() as u64;
        self.clock_us += samples * 1_000_000 / self.sample_rate as u64;
        Some(frame)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
