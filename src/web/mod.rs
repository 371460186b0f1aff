//! Web server: offer negotiation and the privacy-shield REST surface
//!
//! - `POST /offer` - bridge a browser offer, returns the SDP answer
//! - `POST /shield/frame` - review one base64 frame, returns the redacted
//!   image plus detection verdict
//! - `GET /healthz` - liveness probe

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::bridge::{BridgeConfig, Session, SessionHandle, SessionState};
use crate::rtc::{PeerFactory, SessionDescription};
use crate::shield::{blur, FrameFilter};

/// Where bridged sessions connect, plus how they behave.
pub struct BridgeTarget {
    /// Full endpoint URL including credentials
    pub live_url: String,
    pub config: BridgeConfig,
    pub peers: Arc<dyn PeerFactory>,
}

/// Shared state for the web server.
pub struct WebState {
    pub filter: Arc<FrameFilter>,
    pub max_face_count: usize,
    /// None disables `/offer` (shield-only deployment)
    pub bridge: Option<BridgeTarget>,
    /// Sessions created via `/offer`; closed on shutdown
    pub sessions: tokio::sync::Mutex<Vec<SessionHandle>>,
}

impl WebState {
    pub fn new(
        filter: Arc<FrameFilter>,
        max_face_count: usize,
        bridge: Option<BridgeTarget>,
    ) -> Self {
        Self {
            filter,
            max_face_count,
            bridge,
            sessions: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Track a session, sweeping out any that already finished.
    pub async fn register_session(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| s.state() != SessionState::Closed);
        sessions.push(handle);
    }

    /// Close every session created through this server.
    pub async fn close_sessions(&self) {
        let sessions = {
            let mut guard = self.sessions.lock().await;
            std::mem::take(&mut *guard)
        };
        for session in &sessions {
            session.close().await;
        }
    }
}

/// Build the router. `/offer` is always registered; without a bridge
/// target it answers 503 so callers can tell "not configured" from
/// "wrong address".
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/shield/frame", post(shield_frame))
        .route("/offer", post(offer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn start(state: Arc<WebState>, bind: SocketAddr) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("failed to bind to {bind}"))?;
    info!("web server listening on http://{bind}");
    axum::serve(listener, app).await.context("web server error")
}

/// Error responses carry a status and a plain message body.
struct ApiError(StatusCode, String);

impl ApiError {
    fn internal(e: anyhow::Error) -> Self {
        warn!(error = %format!("{e:#}"), "request failed");
        Self(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({"detail": self.1}))).into_response()
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": "kasumi"}))
}

async fn offer(
    State(state): State<Arc<WebState>>,
    Json(offer): Json<SessionDescription>,
) -> Result<Json<SessionDescription>, ApiError> {
    let target = state.bridge.as_ref().ok_or_else(|| {
        ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "bridging is not configured".into(),
        )
    })?;

    let peer = target
        .peers
        .create()
        .await
        .map_err(ApiError::internal)?;

    let (answer, handle) = Session::connect(
        &target.live_url,
        peer,
        state.filter.clone(),
        target.config.clone(),
        offer,
    )
    .await
    .map_err(|e| {
        warn!(error = %format!("{e:#}"), "session setup failed");
        ApiError(StatusCode::BAD_GATEWAY, format!("{e:#}"))
    })?;

    state.register_session(handle).await;
    Ok(Json(answer))
}

#[derive(Debug, Deserialize)]
struct FrameRequest {
    /// Base64 image, with or without a data-URL header
    image_data: String,
    #[serde(default)]
    frame_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct FrameResponse {
    safe: bool,
    processed_image: String,
    human_detected: bool,
    confidence: f32,
    blur_applied: bool,
    face_count: usize,
}

async fn shield_frame(
    State(state): State<Arc<WebState>>,
    Json(request): Json<FrameRequest>,
) -> Result<Json<FrameResponse>, ApiError> {
    // Strip a data-URL header if the browser sent one
    let b64 = request
        .image_data
        .rsplit_once(',')
        .map(|(_, b64)| b64)
        .unwrap_or(&request.image_data);
    let bytes = general_purpose::STANDARD.decode(b64).map_err(|_| {
        ApiError(StatusCode::BAD_REQUEST, "invalid base64 image".into())
    })?;
    let frame = blur::decode_image(&bytes, 0)
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, "undecodable image".into()))?;

    let outcome = state
        .filter
        .filter(frame)
        .await
        .map_err(ApiError::internal)?;

    let face_count = outcome.detection.regions.len();
    if face_count > state.max_face_count {
        return Err(ApiError(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("too many people detected ({face_count}), frame blocked for privacy"),
        ));
    }

    if let Some(ref id) = request.frame_id {
        info!(frame_id = %id, blur = ?outcome.blur, "frame reviewed");
    }

    let jpeg = blur::encode_jpeg(&outcome.frame, state.filter.jpeg_quality())
        .map_err(ApiError::internal)?;

    Ok(Json(FrameResponse {
        safe: !outcome.detection.detected,
        processed_image: general_purpose::STANDARD.encode(jpeg),
        human_detected: outcome.detection.detected,
        confidence: outcome.detection.confidence,
        blur_applied: outcome.blur.is_blurred(),
        face_count,
    }))
}
