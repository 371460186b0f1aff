//! E2E regression suite for the session bridge
//!
//! Uses a real WebSocket pair over a loopback TCP socket as the live
//! endpoint, with scripted fakes for the peer connection and the face
//! detector, to exercise the full track -> filter -> uplink -> endpoint
//! pipeline and the endpoint -> downlink -> playback return path.
//!
//! Run: `cargo test --test bridge_e2e`
//!
//! Tests:
//!   1. A frame with a detected face is redacted before it reaches the wire
//!   2. Synthesized audio lands on the playback track; junk messages do not
//!   3. Close is idempotent and bounded
//!   4. Uplink alternates between backlogged video and audio queues
//!   5. Peer disconnect tears the whole session down
//!   6. Uplink suspends, not spins, after one queue drains
//!   7. Cancellation interrupts a write stalled on a non-reading endpoint
//!   8. The web registry sweeps out sessions that already closed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use kasumi::bridge::{Uplink, UplinkEnd};
use kasumi::queue::TrackQueue;
use kasumi::shield::{blur, Detection, FaceDetector, FrameFilter, Region};
use kasumi::{
    BridgeConfig, CloseReason, EncodedChunk, FrameSource, MediaFrame, MediaKind, PeerConnection,
    PeerEvent, Session, SessionDescription, SessionState, TrackError, VideoFrame,
};

// ============================================================================
// Fakes
// ============================================================================

/// Detector with a fixed scripted response.
struct ScriptedDetector {
    response: Detection,
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    async fn detect(&self, _jpeg: &[u8]) -> anyhow::Result<Detection> {
        Ok(self.response.clone())
    }
}

/// Source yielding scripted frames, then suspending forever.
struct ScriptedSource {
    frames: Vec<MediaFrame>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn recv(&mut self) -> Result<MediaFrame, TrackError> {
        if self.frames.is_empty() {
            std::future::pending::<()>().await;
            unreachable!()
        }
        Ok(self.frames.remove(0))
    }
}

/// Peer connection fake: answers any offer, exposes its event sender and
/// the playback track it was handed so tests can drive both ends.
struct FakePeer {
    events_rx: Option<mpsc::Receiver<PeerEvent>>,
    playback: Arc<Mutex<Option<kasumi::bridge::PlaybackTrack>>>,
    closed: Arc<AtomicBool>,
}

impl FakePeer {
    #[allow(clippy::type_complexity)]
    fn new() -> (
        Box<dyn PeerConnection>,
        mpsc::Sender<PeerEvent>,
        Arc<Mutex<Option<kasumi::bridge::PlaybackTrack>>>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let playback = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let peer = FakePeer {
            events_rx: Some(rx),
            playback: playback.clone(),
            closed: closed.clone(),
        };
        (Box::new(peer), tx, playback, closed)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn set_remote_offer(
        &mut self,
        _offer: SessionDescription,
    ) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0\r\n"))
    }

    fn attach_playback(&mut self, track: kasumi::bridge::PlaybackTrack) {
        *self.playback.lock().unwrap() = Some(track);
    }

    fn take_events(&mut self) -> mpsc::Receiver<PeerEvent> {
        self.events_rx.take().expect("take_events called twice")
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// A connected WebSocket pair over loopback TCP.
async fn ws_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (client, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .unwrap();
    (client, server.await.unwrap())
}

fn test_config() -> BridgeConfig {
    BridgeConfig {
        model: "models/test".into(),
        poll_window: Duration::from_millis(50),
        frame_pacing: Duration::ZERO,
        playback_grace: Duration::from_millis(50),
        teardown_grace: Duration::from_secs(2),
        ..BridgeConfig::default()
    }
}

fn filter_with(detection: Detection) -> Arc<FrameFilter> {
    Arc::new(FrameFilter::new(
        Arc::new(ScriptedDetector {
            response: detection,
        }),
        6.0,
        85,
        Duration::from_millis(200),
    ))
}

/// Flat gray frame with a high-frequency checkerboard patch. JPEG keeps
/// the flat area nearly intact, so a blur inside the patch is clearly
/// separable from codec noise outside it.
fn patched_frame(size: u32, patch: Region) -> VideoFrame {
    let mut pixels = vec![128u8; (size * size * 3) as usize];
    for y in patch.y..(patch.y + patch.height).min(size) {
        for x in patch.x..(patch.x + patch.width).min(size) {
            let v = if (x + y) % 2 == 0 { 255u8 } else { 0u8 };
            let idx = ((y * size + x) * 3) as usize;
            pixels[idx..idx + 3].copy_from_slice(&[v, v, v]);
        }
    }
    VideoFrame::from_rgb8(Bytes::from(pixels), size, size, 0).unwrap()
}

fn region_diff(a: &VideoFrame, b: &VideoFrame, size: u32, region: Region, inside: bool) -> f64 {
    let mut total = 0u64;
    let mut count = 0u64;
    for y in 0..size {
        for x in 0..size {
            let in_box = x >= region.x
                && x < region.x + region.width
                && y >= region.y
                && y < region.y + region.height;
            if in_box != inside {
                continue;
            }
            let idx = ((y * size + x) * 3) as usize;
            total += a.pixels[idx].abs_diff(b.pixels[idx]) as u64;
            count += 1;
        }
    }
    total as f64 / count as f64
}

async fn next_text(server: &mut WebSocketStream<TcpStream>, wait: Duration) -> String {
    let msg = tokio::time::timeout(wait, server.next())
        .await
        .expect("no message within deadline")
        .expect("stream ended")
        .expect("read error");
    msg.into_text().expect("expected a text frame")
}

// ============================================================================
// Tests
// ============================================================================

/// Test 1: A frame with a detected face arrives on the wire blurred inside
/// the reported box and essentially untouched outside it.
#[tokio::test(flavor = "multi_thread")]
async fn detected_face_is_redacted_on_the_wire() {
    let face = Region {
        x: 16,
        y: 16,
        width: 24,
        height: 24,
    };
    let frame = patched_frame(64, face);
    let original = frame.clone();

    let (client, mut server) = ws_pair().await;
    let (peer, events, _playback, _closed) = FakePeer::new();
    let filter = filter_with(Detection {
        detected: true,
        confidence: 0.97,
        regions: vec![face],
    });

    let (answer, handle) = Session::establish(
        client,
        peer,
        filter,
        test_config(),
        SessionDescription::offer("v=0\r\n"),
    )
    .await
    .unwrap();
    assert_eq!(answer.kind, "answer");

    // Handshake reaches the endpoint before any media
    let setup = next_text(&mut server, Duration::from_secs(2)).await;
    let setup: Value = serde_json::from_str(&setup).unwrap();
    assert_eq!(setup["setup"]["model"], "models/test");

    events
        .send(PeerEvent::Track {
            kind: MediaKind::Video,
            source: Box::new(ScriptedSource {
                frames: vec![MediaFrame::Video(frame)],
            }),
        })
        .await
        .unwrap();

    // One frame in, exactly one media message out within a poll cycle
    let media = next_text(&mut server, Duration::from_secs(2)).await;
    let media: Value = serde_json::from_str(&media).unwrap();
    let chunk = &media["realtime_input"]["media_chunks"][0];
    assert_eq!(chunk["mime_type"], "image/jpeg");

    let jpeg = general_purpose::STANDARD
        .decode(chunk["data"].as_str().unwrap())
        .unwrap();
    let uploaded = blur::decode_image(&jpeg, 0).unwrap();
    assert_eq!(uploaded.width, 64);

    let inside = region_diff(&original, &uploaded, 64, face, true);
    let outside = region_diff(&original, &uploaded, 64, face, false);
    assert!(inside > 40.0, "face region must be blurred, diff {inside}");
    assert!(outside < 10.0, "rest of frame must survive, diff {outside}");

    handle.close().await;
}

/// Test 2: Each audio-bearing endpoint message produces exactly one
/// playback push; junk messages produce none and do not fault anything.
#[tokio::test(flavor = "multi_thread")]
async fn downlink_audio_reaches_playback_and_junk_is_ignored() {
    let (client, mut server) = ws_pair().await;
    let (peer, _events, playback, _closed) = FakePeer::new();
    let filter = filter_with(Detection::clear());

    let (_, handle) = Session::establish(
        client,
        peer,
        filter,
        test_config(),
        SessionDescription::offer("v=0\r\n"),
    )
    .await
    .unwrap();
    // Drain the setup message
    next_text(&mut server, Duration::from_secs(2)).await;

    let mut track = playback.lock().unwrap().take().unwrap();

    let pcm: Vec<u8> = (0..640u32).map(|i| (i % 251) as u8).collect();
    let payload = json!({
        "serverContent": {
            "modelDraft": {
                "inlineData": {"data": general_purpose::STANDARD.encode(&pcm)}
            }
        }
    });
    server
        .send(Message::Text(payload.to_string()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), track.next_frame())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.pcm.as_ref(), pcm.as_slice());
    assert_eq!(frame.sample_rate, 16000);

    // Junk shapes: no push, no fault. The grace timeout synthesizes
    // silence instead.
    server
        .send(Message::Text(r#"{"ping": true}"#.into()))
        .await
        .unwrap();
    server
        .send(Message::Text("not json at all".into()))
        .await
        .unwrap();

    let frame = track.next_frame().await.unwrap();
    assert!(frame.pcm.iter().all(|&b| b == 0), "expected silence");
    assert!(handle.close_reason().is_none(), "junk must not close the session");

    handle.close().await;
}

/// Test 3: Close finishes within the teardown grace and a second close
/// is a no-op that does not change the recorded reason.
#[tokio::test(flavor = "multi_thread")]
async fn close_is_idempotent_and_bounded() {
    let (client, _server) = ws_pair().await;
    let (peer, events, _playback, closed) = FakePeer::new();
    let filter = filter_with(Detection::clear());

    let (_, handle) = Session::establish(
        client,
        peer,
        filter,
        test_config(),
        SessionDescription::offer("v=0\r\n"),
    )
    .await
    .unwrap();

    // A live track with a source that never yields: close must still win
    events
        .send(PeerEvent::Track {
            kind: MediaKind::Video,
            source: Box::new(ScriptedSource { frames: vec![] }),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), SessionState::Active);

    tokio::time::timeout(Duration::from_secs(3), handle.close())
        .await
        .expect("close must finish within the grace period");
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(handle.close_reason(), Some(CloseReason::Explicit));
    assert!(closed.load(Ordering::SeqCst), "peer must be closed");

    // Second close: immediate no-op
    tokio::time::timeout(Duration::from_millis(500), handle.close())
        .await
        .expect("second close must return at once");
    assert_eq!(handle.close_reason(), Some(CloseReason::Explicit));
}

/// Test 4: With both queues backlogged the uplink alternates strictly
/// between them, so neither stream starves the other.
#[tokio::test(flavor = "multi_thread")]
async fn uplink_alternates_between_backlogged_queues() {
    let (client, mut server) = ws_pair().await;
    let (sink, _stream) = client.split();

    let video: Arc<TrackQueue<EncodedChunk>> = Arc::new(TrackQueue::new(4));
    let audio: Arc<TrackQueue<EncodedChunk>> = Arc::new(TrackQueue::new(4));
    for i in 0..3 {
        video.push(EncodedChunk::jpeg(format!("dmlkZW8{i}")));
        audio.push(EncodedChunk::pcm(format!("YXVkaW8{i}")));
    }
    video.close();
    audio.close();

    let uplink = Uplink::new(
        sink,
        video,
        Some(audio),
        Duration::from_millis(50),
        CancellationToken::new(),
    );
    let end = uplink.run().await.unwrap();
    assert_eq!(end, UplinkEnd::Ended);

    let mut kinds = Vec::new();
    for _ in 0..6 {
        let text = next_text(&mut server, Duration::from_secs(2)).await;
        let value: Value = serde_json::from_str(&text).unwrap();
        kinds.push(
            value["realtime_input"]["media_chunks"][0]["mime_type"]
                .as_str()
                .unwrap()
                .to_string(),
        );
    }

    assert_eq!(kinds.iter().filter(|k| *k == "image/jpeg").count(), 3);
    assert_eq!(kinds.iter().filter(|k| *k == "audio/pcm").count(), 3);
    for pair in kinds.windows(2) {
        assert_ne!(pair[0], pair[1], "backlogged streams must alternate: {kinds:?}");
    }
}

/// Test 6: After the video track ends (queue closed and drained) while
/// audio stays open, the uplink must keep suspending on its poll window
/// rather than busy-looping on the drained queue's instantly-ready pop.
///
/// Runs on the current-thread flavor on purpose: a busy loop would
/// monopolize the only worker, this task would never be scheduled again,
/// and the test would time out instead of finishing in milliseconds.
#[tokio::test]
async fn uplink_suspends_after_one_queue_drains() {
    let (client, mut server) = ws_pair().await;
    let (sink, _stream) = client.split();

    let video: Arc<TrackQueue<EncodedChunk>> = Arc::new(TrackQueue::new(2));
    video.close();
    let audio: Arc<TrackQueue<EncodedChunk>> = Arc::new(TrackQueue::new(2));

    let uplink = Uplink::new(
        sink,
        video,
        Some(audio.clone()),
        Duration::from_millis(50),
        CancellationToken::new(),
    );
    let task = tokio::spawn(uplink.run());

    // Several poll windows pass with only audio open; control must come
    // back to this task in between.
    tokio::time::sleep(Duration::from_millis(200)).await;

    audio.push(EncodedChunk::pcm("cGNt".into()));
    audio.close();

    let end = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("uplink must finish once every queue drains")
        .unwrap()
        .unwrap();
    assert_eq!(end, UplinkEnd::Ended);

    let text = next_text(&mut server, Duration::from_secs(2)).await;
    assert!(text.contains("audio/pcm"));
}

/// Test 7: An endpoint that stops reading must not pin the uplink task:
/// cancellation has to interrupt a send stalled on TCP backpressure so
/// teardown stays bounded.
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_interrupts_stalled_write() {
    let (client, server) = ws_pair().await;
    let (sink, _stream) = client.split();

    // Enough payload to overrun the socket buffers of a peer that never
    // reads, so a send genuinely blocks.
    let video: Arc<TrackQueue<EncodedChunk>> = Arc::new(TrackQueue::new(4));
    for _ in 0..4 {
        video.push(EncodedChunk::jpeg("A".repeat(8 * 1024 * 1024)));
    }

    let cancel = CancellationToken::new();
    let uplink = Uplink::new(
        sink,
        video,
        None,
        Duration::from_millis(50),
        cancel.clone(),
    );
    let task = tokio::spawn(uplink.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let end = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("cancellation must interrupt a stalled send")
        .unwrap()
        .unwrap();
    assert_eq!(end, UplinkEnd::Cancelled);

    drop(server);
}

/// Test 5: When the peer goes away the whole session winds down on its
/// own: queues close, tasks join, the reason is recorded.
#[tokio::test(flavor = "multi_thread")]
async fn peer_disconnect_tears_down_session() {
    let (client, mut server) = ws_pair().await;
    let (peer, events, playback, closed) = FakePeer::new();
    let filter = filter_with(Detection::clear());

    let (_, handle) = Session::establish(
        client,
        peer,
        filter,
        test_config(),
        SessionDescription::offer("v=0\r\n"),
    )
    .await
    .unwrap();
    next_text(&mut server, Duration::from_secs(2)).await;

    events.send(PeerEvent::Disconnected).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), handle.wait())
        .await
        .expect("session must wind down after peer disconnect");
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(handle.close_reason(), Some(CloseReason::PeerDisconnected));
    assert!(closed.load(Ordering::SeqCst));

    // Playback drains to None once the session is gone
    let mut track = playback.lock().unwrap().take().unwrap();
    assert!(track.next_frame().await.is_none());
}

/// Test 8: Registering a new session with the web state prunes handles
/// whose session already reached Closed, so the registry does not grow
/// without bound over a server's lifetime.
#[tokio::test(flavor = "multi_thread")]
async fn session_registry_sweeps_closed_handles() {
    async fn establish_one() -> (kasumi::SessionHandle, WebSocketStream<TcpStream>) {
        let (client, server) = ws_pair().await;
        let (peer, _events, _playback, _closed) = FakePeer::new();
        let (_, handle) = Session::establish(
            client,
            peer,
            filter_with(Detection::clear()),
            test_config(),
            SessionDescription::offer("v=0\r\n"),
        )
        .await
        .unwrap();
        (handle, server)
    }

    let state = Arc::new(kasumi::web::WebState::new(
        filter_with(Detection::clear()),
        3,
        None,
    ));

    let (first, _server_a) = establish_one().await;
    first.close().await;
    assert_eq!(first.state(), SessionState::Closed);
    state.register_session(first).await;

    let (second, _server_b) = establish_one().await;
    state.register_session(second).await;

    let sessions = state.sessions.lock().await;
    assert_eq!(sessions.len(), 1, "closed handle must be swept");
    assert_ne!(sessions[0].state(), SessionState::Closed);
    drop(sessions);

    state.close_sessions().await;
}
