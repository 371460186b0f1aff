//! Session lifecycle: negotiation, active bridging, idempotent teardown
//!
//! A session owns one peer connection, one duplex endpoint connection,
//! and every loop task in between. All tasks are spawned on a
//! `TaskTracker` and cancelled through a single `CancellationToken`, so
//! no loop can outlive its session. The `Active -> Closing` edge is a
//! single atomic transition shared by every fault path; whichever loop
//! faults first wins and the rest is a no-op.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bridge::downlink::{Downlink, DownlinkEnd};
use crate::bridge::tracks::{audio_pump, video_pump, PlaybackTrack, PumpEnd};
use crate::bridge::uplink::{Uplink, UplinkEnd};
use crate::frame::{EncodedChunk, MediaKind};
use crate::queue::TrackQueue;
use crate::rtc::{PeerConnection, PeerEvent, SessionDescription};
use crate::shield::FrameFilter;

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Offer/answer exchanged, no media flowing yet
    Negotiating = 0,
    /// Tracks observed, endpoint handshake done, loops running
    Active = 1,
    /// First fault or close request seen, loops being cancelled
    Closing = 2,
    /// Terminal: every task joined, resources released
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Negotiating,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session began closing. The first reporter wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit close request from the owner
    Explicit,
    /// The browser peer disconnected
    PeerDisconnected,
    /// An inbound track ended normally
    TrackEnded,
    /// An inbound track failed mid-stream
    TrackFault,
    /// The endpoint closed the connection cleanly
    EndpointClosed,
    /// Read or write fault on the endpoint connection
    ConnectionFault,
}

/// Tunables for one session, derived from [`crate::config::Settings`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Model identifier announced in the setup handshake
    pub model: String,
    /// Capacity of each media queue
    pub queue_capacity: usize,
    /// Uplink bounded wait on the media queues
    pub poll_window: Duration,
    /// Delay between forwarded video frames
    pub frame_pacing: Duration,
    /// How long the playback track waits before synthesizing silence
    pub playback_grace: Duration,
    /// How long teardown waits for loops to finish
    pub teardown_grace: Duration,
    /// Sample rate of synthesized audio handed back to the peer
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
    /// Forward inbound audio to the endpoint alongside video
    pub forward_audio: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            queue_capacity: 2,
            poll_window: Duration::from_millis(500),
            frame_pacing: Duration::from_secs(1),
            playback_grace: Duration::from_millis(100),
            teardown_grace: Duration::from_secs(5),
            audio_sample_rate: 16000,
            audio_channels: 1,
            forward_audio: true,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Negotiating as u8))
    }

    fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Negotiating -> Active. False if the session already left Negotiating.
    fn activate(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Negotiating as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Any pre-closing state -> Closing. True only for the caller that
    /// actually made the transition.
    fn begin_close(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            if current >= SessionState::Closing as u8 {
                return false;
            }
            if self
                .0
                .compare_exchange(
                    current,
                    SessionState::Closing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    fn finalize(&self) {
        self.0.store(SessionState::Closed as u8, Ordering::SeqCst);
    }
}

/// Type-erased handle for closing a queue during teardown.
trait CloseSignal: Send + Sync {
    fn close_now(&self);
}

impl<T: Send> CloseSignal for TrackQueue<T> {
    fn close_now(&self) {
        self.close();
    }
}

/// Shared teardown latch: the single place where `Active -> Closing`
/// happens. Safe to call from every loop; only the first call acts.
struct Teardown {
    state: StateCell,
    cancel: CancellationToken,
    queues: Vec<Arc<dyn CloseSignal>>,
    reason: Mutex<Option<CloseReason>>,
}

impl Teardown {
    fn begin(&self, reason: CloseReason) {
        if !self.state.begin_close() {
            debug!(?reason, "session already closing, ignoring");
            return;
        }
        *self.reason.lock().unwrap() = Some(reason);
        info!(?reason, "session closing");
        for queue in &self.queues {
            queue.close_now();
        }
        self.cancel.cancel();
    }
}

/// Owner-facing handle to a running session.
pub struct SessionHandle {
    teardown: Arc<Teardown>,
    tracker: TaskTracker,
    grace: Duration,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.teardown.state.load()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.teardown.reason.lock().unwrap()
    }

    /// Begin teardown and wait (bounded) for every loop to finish.
    /// Idempotent: closing a closing or closed session is a no-op.
    pub async fn close(&self) {
        self.teardown.begin(CloseReason::Explicit);
        self.join().await;
    }

    /// Wait for the session to finish on its own (peer disconnect,
    /// endpoint close, or fault), then release it.
    pub async fn wait(&self) {
        self.tracker.wait().await;
        self.teardown.state.finalize();
    }

    async fn join(&self) {
        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(grace_ms = self.grace.as_millis() as u64, "session teardown timed out");
        }
        self.teardown.state.finalize();
    }
}

/// One bridged call. Construct via [`Session::establish`].
pub struct Session;

impl Session {
    /// Bridge a peer connection over an already-open duplex stream.
    ///
    /// Performs the endpoint setup handshake and the offer/answer
    /// exchange; a failure in either surfaces here and the session never
    /// reaches `Active`. On success the returned answer goes back to the
    /// caller and all bridge loops are running.
    pub async fn establish<S>(
        ws: WebSocketStream<S>,
        mut peer: Box<dyn PeerConnection>,
        filter: Arc<FrameFilter>,
        cfg: BridgeConfig,
        offer: SessionDescription,
    ) -> Result<(SessionDescription, SessionHandle)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let video: Arc<TrackQueue<EncodedChunk>> = Arc::new(TrackQueue::new(cfg.queue_capacity));
        let audio_up: Option<Arc<TrackQueue<EncodedChunk>>> = cfg
            .forward_audio
            .then(|| Arc::new(TrackQueue::new(cfg.queue_capacity)));
        let playback: Arc<TrackQueue<Bytes>> = Arc::new(TrackQueue::new(cfg.queue_capacity.max(4)));

        let cancel = CancellationToken::new();
        let mut uplink = Uplink::new(
            sink,
            video.clone(),
            audio_up.clone(),
            cfg.poll_window,
            cancel.clone(),
        );

        // Endpoint handshake first: a setup failure must reach the caller
        // before any media task exists.
        if let Err(e) = uplink.send_setup(&cfg.model).await {
            peer.close().await;
            return Err(e);
        }

        peer.attach_playback(PlaybackTrack::new(
            playback.clone(),
            cfg.audio_sample_rate,
            cfg.audio_channels,
            cfg.playback_grace,
        ));

        let answer = match peer.set_remote_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                peer.close().await;
                return Err(e);
            }
        };
        let events = peer.take_events();

        let mut queues: Vec<Arc<dyn CloseSignal>> = vec![video.clone(), playback.clone()];
        if let Some(ref q) = audio_up {
            queues.push(q.clone());
        }
        let teardown = Arc::new(Teardown {
            state: StateCell::new(),
            cancel: cancel.clone(),
            queues,
            reason: Mutex::new(None),
        });

        let tracker = TaskTracker::new();

        // Uplink writer
        {
            let teardown = teardown.clone();
            tracker.spawn(async move {
                match uplink.run().await {
                    Ok(UplinkEnd::Ended) => teardown.begin(CloseReason::TrackEnded),
                    Ok(UplinkEnd::Cancelled) => {}
                    Err(e) => {
                        error!(error = %e, "uplink fault");
                        teardown.begin(CloseReason::ConnectionFault);
                    }
                }
            });
        }

        // Downlink reader
        {
            let teardown = teardown.clone();
            let downlink = Downlink::new(stream, playback.clone(), cancel.clone());
            tracker.spawn(async move {
                match downlink.run().await {
                    Ok(DownlinkEnd::EndpointClosed) => teardown.begin(CloseReason::EndpointClosed),
                    Ok(DownlinkEnd::Cancelled) => {}
                    Err(e) => {
                        error!(error = %e, "downlink fault");
                        teardown.begin(CloseReason::ConnectionFault);
                    }
                }
            });
        }

        // Orchestrator: consumes peer events, spawns one pump per track,
        // closes the peer when the session winds down.
        {
            let teardown = teardown.clone();
            let tracker_inner = tracker.clone();
            let cancel = cancel.clone();
            let cfg = cfg.clone();
            tracker.spawn(run_orchestrator(
                peer,
                events,
                filter,
                video,
                audio_up,
                teardown,
                tracker_inner,
                cancel,
                cfg,
            ));
        }

        tracker.close();

        Ok((
            answer,
            SessionHandle {
                teardown,
                tracker,
                grace: cfg.teardown_grace,
            },
        ))
    }

    /// Convenience: connect to the endpoint at `url`, then establish.
    pub async fn connect(
        url: &str,
        peer: Box<dyn PeerConnection>,
        filter: Arc<FrameFilter>,
        cfg: BridgeConfig,
        offer: SessionDescription,
    ) -> Result<(SessionDescription, SessionHandle)> {
        let ws = crate::live::connect(url).await?;
        Self::establish(ws, peer, filter, cfg, offer).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_orchestrator(
    mut peer: Box<dyn PeerConnection>,
    mut events: mpsc::Receiver<PeerEvent>,
    filter: Arc<FrameFilter>,
    video: Arc<TrackQueue<EncodedChunk>>,
    audio_up: Option<Arc<TrackQueue<EncodedChunk>>>,
    teardown: Arc<Teardown>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    cfg: BridgeConfig,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(PeerEvent::Track { kind, source }) => {
                if teardown.state.activate() {
                    info!(first_track = %kind, "session active");
                }
                match kind {
                    MediaKind::Video => {
                        let teardown = teardown.clone();
                        let filter = filter.clone();
                        let queue = video.clone();
                        let cancel = cancel.clone();
                        let pacing = cfg.frame_pacing;
                        tracker.spawn(async move {
                            match video_pump(source, filter, queue, pacing, cancel).await {
                                PumpEnd::Ended => teardown.begin(CloseReason::TrackEnded),
                                PumpEnd::Failed => teardown.begin(CloseReason::TrackFault),
                                PumpEnd::Cancelled => {}
                            }
                        });
                    }
                    MediaKind::Audio => match audio_up.clone() {
                        Some(queue) => {
                            let teardown = teardown.clone();
                            let cancel = cancel.clone();
                            tracker.spawn(async move {
                                match audio_pump(source, queue, cancel).await {
                                    PumpEnd::Ended => teardown.begin(CloseReason::TrackEnded),
                                    PumpEnd::Failed => teardown.begin(CloseReason::TrackFault),
                                    PumpEnd::Cancelled => {}
                                }
                            });
                        }
                        None => debug!("audio forwarding disabled, ignoring audio track"),
                    },
                }
            }
            Some(PeerEvent::Disconnected) | None => {
                teardown.begin(CloseReason::PeerDisconnected);
                break;
            }
        }
    }

    peer.close().await;
}
