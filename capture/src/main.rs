//! NanoCam Capture Server – serves image and video requests from the camera.
//!
//! This binary:
//! 1. Reads configuration from `nanocam.conf`
//! 2. Configures the capture engine (gst-launch pipelines or simulated)
//! 3. Accepts client connections and arbitrates the single camera session

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use nanocam_capture::arbiter::{Arbiter, ArbiterOptions};
use nanocam_capture::engine::{CameraSettings, CaptureEngine};
use nanocam_capture::server::{self, ServerOptions};
use nanocam_capture::{GstEngine, SimulatedEngine};
use nanocam_common::config::{self, Config, EngineKind};

/// How long the active session gets to finish after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load_or_default(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!(
        "NanoCam Capture Server starting (listen={}, engine={:?}, framing={})",
        config.listen_addr, config.engine, config.framing
    );

    std::fs::create_dir_all(&config.media_dir)
        .with_context(|| format!("Cannot create media directory {}", config.media_dir.display()))?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::Relaxed) {
            std::process::exit(1);
        }
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── capture engine ───────────────────────────────────────────────
    let engine: Arc<dyn CaptureEngine> = match config.engine {
        EngineKind::Gst => Arc::new(GstEngine::new()),
        EngineKind::Simulated => Arc::new(SimulatedEngine::new()),
    };
    engine
        .configure(CameraSettings::from_config(&config))
        .context("Cannot configure capture engine")?;

    // ── serve ────────────────────────────────────────────────────────
    let arbiter = Arbiter::new(engine, ArbiterOptions::from_config(&config));
    server::run(
        arbiter.clone(),
        &config.listen_addr,
        ServerOptions::from_config(&config),
        shutdown,
    )
    .await?;

    if tokio::time::timeout(SHUTDOWN_GRACE, arbiter.wait_idle())
        .await
        .is_err()
    {
        warn!("Active session did not stop within {}s", SHUTDOWN_GRACE.as_secs());
    }
    info!("NanoCam Capture Server stopped");
    Ok(())
}
