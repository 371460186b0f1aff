//! Persistent duplex connection to the streaming generative endpoint
//!
//! One WebSocket per session, written to by exactly one task (the uplink)
//! and read by exactly one task (the downlink).

pub mod protocol;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

pub use protocol::{decode_audio, extract_audio_b64, ClientMessage, RealtimeInput, Setup};

/// The concrete stream type produced by [`connect`].
pub type LiveStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the duplex connection to the endpoint.
///
/// The URL carries the API key as a query parameter, so it is never logged.
pub async fn connect(url: &str) -> Result<LiveStream> {
    let (ws, _response) = connect_async(url)
        .await
        .context("failed to connect to live endpoint")?;
    info!("live endpoint connected");
    Ok(ws)
}

/// Wrap an outbound message in a WebSocket text frame.
pub fn text_message(msg: &ClientMessage) -> Result<Message> {
    Ok(Message::Text(msg.to_json()?))
}
