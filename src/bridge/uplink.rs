//! Uplink multiplexer: drains the media queues onto the duplex socket
//!
//! Exactly one task writes to the connection. The loop polls the queues
//! with a bounded wait (an empty window is normal for 1 fps video, not
//! a fault) and fans in between video and audio round-robin so neither
//! starves the other under backlog. Write errors are session-fatal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frame::EncodedChunk;
use crate::live::{self, ClientMessage};
use crate::queue::TrackQueue;

/// How the uplink loop finished (write faults surface as errors instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkEnd {
    /// All source queues closed and drained
    Ended,
    /// Session teardown cancelled the loop
    Cancelled,
}

pub struct Uplink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    video: Arc<TrackQueue<EncodedChunk>>,
    audio: Option<Arc<TrackQueue<EncodedChunk>>>,
    poll_window: Duration,
    cancel: CancellationToken,
    /// Round-robin pointer: true when audio should be tried first
    prefer_audio: bool,
}

impl<S> Uplink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        sink: SplitSink<WebSocketStream<S>, Message>,
        video: Arc<TrackQueue<EncodedChunk>>,
        audio: Option<Arc<TrackQueue<EncodedChunk>>>,
        poll_window: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            video,
            audio,
            poll_window,
            cancel,
            prefer_audio: false,
        }
    }

    /// Send the one-time handshake announcing stream parameters.
    pub async fn send_setup(&mut self, model: &str) -> Result<()> {
        let msg = live::text_message(&ClientMessage::setup(model))?;
        if !self
            .send_or_cancel(msg)
            .await
            .context("setup handshake write failed")?
        {
            anyhow::bail!("session cancelled during setup handshake");
        }
        Ok(())
    }

    /// Drain the queues until they close or the session is cancelled.
    ///
    /// Returns Err only on a connection write fault.
    pub async fn run(mut self) -> Result<UplinkEnd> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(UplinkEnd::Cancelled);
            }

            // Serve whatever is already buffered, round-robin between
            // the queues so a backlog on one never starves the other.
            if let Some(chunk) = self.next_buffered() {
                if !self.write_chunk(chunk).await? {
                    return Ok(UplinkEnd::Cancelled);
                }
                continue;
            }

            if self.sources_finished() {
                debug!("all media queues drained, uplink done");
                return Ok(UplinkEnd::Ended);
            }

            // Nothing pending: wait up to one poll window for an item.
            // A timeout here is transient absence, not an error. A queue
            // that is already drained must not arm a pop here: its pop
            // would complete at once with None and turn the wait into a
            // busy loop, so a drained queue's arm pends instead.
            let audio = self.audio.clone();
            let video = self.video.clone();
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(UplinkEnd::Cancelled),
                _ = tokio::time::sleep(self.poll_window) => {
                    trace!("no media within poll window");
                }
                item = pop_open(video) => {
                    if let Some(chunk) = item {
                        self.prefer_audio = true;
                        if !self.write_chunk(chunk).await? {
                            return Ok(UplinkEnd::Cancelled);
                        }
                    }
                }
                item = pop_audio(audio) => {
                    if let Some(chunk) = item {
                        self.prefer_audio = false;
                        if !self.write_chunk(chunk).await? {
                            return Ok(UplinkEnd::Cancelled);
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking round-robin pull across the queues.
    fn next_buffered(&mut self) -> Option<EncodedChunk> {
        let audio_first = self.prefer_audio && self.audio.is_some();
        if audio_first {
            if let Some(chunk) = self.audio.as_ref().and_then(|q| q.try_pop()) {
                self.prefer_audio = false;
                return Some(chunk);
            }
        }
        if let Some(chunk) = self.video.try_pop() {
            self.prefer_audio = true;
            return Some(chunk);
        }
        if !audio_first {
            if let Some(chunk) = self.audio.as_ref().and_then(|q| q.try_pop()) {
                self.prefer_audio = false;
                return Some(chunk);
            }
        }
        None
    }

    fn sources_finished(&self) -> bool {
        self.video.is_drained()
            && self
                .audio
                .as_ref()
                .map(|q| q.is_drained())
                .unwrap_or(true)
    }

    /// Write one chunk, racing the send against cancellation so a
    /// stalled endpoint cannot pin the task past teardown.
    /// Returns false when the session was cancelled mid-send.
    async fn write_chunk(&mut self, chunk: EncodedChunk) -> Result<bool> {
        let msg = live::text_message(&ClientMessage::media(chunk))?;
        self.send_or_cancel(msg)
            .await
            .context("media chunk write failed")
    }

    async fn send_or_cancel(&mut self, msg: Message) -> Result<bool> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(false),
            result = self.sink.send(msg) => {
                result.context("connection write failed")?;
                Ok(true)
            }
        }
    }
}

/// Pop from a queue unless it is already drained, in which case pend
/// forever so the caller's select falls through to its poll window.
async fn pop_open(queue: Arc<TrackQueue<EncodedChunk>>) -> Option<EncodedChunk> {
    if queue.is_drained() {
        std::future::pending().await
    } else {
        queue.pop().await
    }
}

/// Pop from the audio queue, or pend forever when audio is not forwarded
/// or already drained (keeps the select arms uniform).
async fn pop_audio(queue: Option<Arc<TrackQueue<EncodedChunk>>>) -> Option<EncodedChunk> {
    match queue {
        Some(q) if !q.is_drained() => q.pop().await,
        _ => std::future::pending().await,
    }
}
