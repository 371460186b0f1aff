//! Downlink demultiplexer: reads endpoint replies, extracts audio
//!
//! Exactly one task reads from the connection, concurrently with the
//! uplink's writes. Messages carrying synthesized audio are decoded and
//! pushed onto the playback queue; everything else is ignored so unknown
//! server messages never fault the session.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::live::protocol;
use crate::queue::TrackQueue;

/// How the downlink loop finished (read faults surface as errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkEnd {
    /// The endpoint closed the connection cleanly
    EndpointClosed,
    /// Session teardown cancelled the loop
    Cancelled,
}

pub struct Downlink<S> {
    stream: SplitStream<WebSocketStream<S>>,
    playback: Arc<TrackQueue<Bytes>>,
    cancel: CancellationToken,
}

impl<S> Downlink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: SplitStream<WebSocketStream<S>>,
        playback: Arc<TrackQueue<Bytes>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            playback,
            cancel,
        }
    }

    /// Read until the connection closes or the session is cancelled.
    ///
    /// The playback queue is closed on every exit path so the outbound
    /// track observes the end of stream.
    pub async fn run(mut self) -> Result<DownlinkEnd> {
        let result = self.read_loop().await;
        self.playback.close();
        result
    }

    async fn read_loop(&mut self) -> Result<DownlinkEnd> {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(DownlinkEnd::Cancelled),
                message = self.stream.next() => message,
            };

            match message {
                None => return Ok(DownlinkEnd::EndpointClosed),
                Some(Err(e)) => {
                    return Err(e).context("live endpoint read failed");
                }
                Some(Ok(Message::Text(text))) => self.handle_payload(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => self.handle_payload(&data),
                Some(Ok(Message::Close(_))) => return Ok(DownlinkEnd::EndpointClosed),
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
            }
        }
    }

    /// Parse one inbound payload. Malformed or unrecognized messages are
    /// recovered locally: logged and skipped, never fatal.
    fn handle_payload(&self, payload: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable endpoint message");
                return;
            }
        };

        let Some(b64) = protocol::extract_audio_b64(&value) else {
            trace!("endpoint message without audio payload ignored");
            return;
        };

        match protocol::decode_audio(b64) {
            Ok(pcm) => {
                self.playback.push(pcm);
            }
            Err(e) => debug!(error = %e, "ignoring undecodable audio payload"),
        }
    }
}
