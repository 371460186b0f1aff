//! Kasumi Server Binary
//!
//! Runs the privacy shield REST surface and, when bridging is wired up,
//! the browser offer endpoint. Without a peer stack the server still
//! serves `/shield/frame` and `/healthz`, which is enough for a
//! shield-only deployment in front of another media pipeline.
//!
//! ## Usage
//!
//! ```bash
//! # Shield-only mode
//! KASUMI_VISION_URL=http://localhost:8001 kasumi-server
//!
//! # Custom port and blur strength
//! KASUMI_WEB_PORT=9000 KASUMI_BLUR_SIGMA=25 kasumi-server
//!
//! # With verbose logging
//! RUST_LOG=kasumi=debug kasumi-server
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use kasumi::shield::{FrameFilter, RestDetector};
use kasumi::web::{self, WebState};
use kasumi::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kasumi=info".parse().unwrap()),
        )
        .init();

    let settings = Settings::from_env();

    info!("Kasumi Server starting");
    info!("  Web port: {}", settings.web_port);
    info!("  Blur sigma: {}", settings.blur_sigma);
    info!("  Max face count: {}", settings.max_face_count);

    let vision_url = settings
        .vision_url
        .clone()
        .context("KASUMI_VISION_URL must be set")?;
    info!("  Vision service: {}", vision_url);

    let detector = Arc::new(RestDetector::new(vision_url));
    let filter = Arc::new(FrameFilter::new(
        detector,
        settings.blur_sigma,
        settings.jpeg_quality,
        settings.detector_timeout,
    ));

    let state = Arc::new(WebState::new(filter, settings.max_face_count, None));
    let bind = SocketAddr::from(([0, 0, 0, 0], settings.web_port));

    let server = {
        let state = Arc::clone(&state);
        tokio::spawn(async move { web::start(state, bind).await })
    };

    tokio::select! {
        result = server => {
            result.context("web server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    state.close_sessions().await;
    info!("Kasumi Server stopped");
    Ok(())
}
