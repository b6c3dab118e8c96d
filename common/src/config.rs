//! Configuration parsing – reads a KEY=VALUE file (`nanocam.conf`).
//!
//! The capture server and the media client load the same format; each
//! ignores fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::framing::Framing;

/// Which capture engine the server drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// `gst-launch-1.0` pipelines on the CSI camera.
    Gst,
    /// Synthetic media, no camera required.
    Simulated,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gst" | "gstreamer" => Ok(Self::Gst),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(format!("unknown engine {other:?} (expected gst or simulated)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // ── network ──────────────────────────────────────────────────────
    /// Address the capture server listens on.
    pub listen_addr: String,
    /// Address the client connects to.
    pub server_addr: String,
    /// UDP port video is streamed to on the client.
    pub media_port: u16,
    pub framing: Framing,
    /// Socket read size in bytes.
    pub read_chunk: usize,

    // ── capture (server) ─────────────────────────────────────────────
    pub media_dir: PathBuf,
    pub engine: EngineKind,
    pub camera_width: u32,
    pub camera_height: u32,
    pub framerate: u32,
    pub flip_method: u32,
    pub capture_format: String,
    pub sensor_id: u32,
    /// Frames captured per still; only the last one is kept.
    pub delay_frames: u32,
    pub video_encoder: String,
    /// Capacity of the in-memory frame channel.
    pub frame_queue: usize,

    // ── client ───────────────────────────────────────────────────────
    pub receive_dir: PathBuf,
    /// The UDP receiver stops after this long without datagrams.
    pub udp_idle_timeout_secs: u64,
    /// 0 disables the response read timeout.
    pub response_timeout_secs: u64,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/nanocam/nanocam.conf"
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

/// Like [`load`], but falls back to defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load(path)
    } else {
        info!("No config at {} – using defaults", path.display());
        Ok(Config::default())
    }
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    let framing = match get("FRAMING").map(|v| v.parse::<Framing>()) {
        Some(Ok(f)) => f,
        Some(Err(e)) => {
            warn!("{e} – using default framing");
            Framing::default()
        }
        None => Framing::default(),
    };
    let engine = match get("ENGINE").map(|v| v.parse::<EngineKind>()) {
        Some(Ok(e)) => e,
        Some(Err(e)) => {
            warn!("{e} – using gst engine");
            EngineKind::Gst
        }
        None => EngineKind::Gst,
    };

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:7200".into()),
        server_addr: get("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:7200".into()),
        media_port: get("MEDIA_PORT").and_then(|v| v.parse().ok()).unwrap_or(5004),
        framing,
        read_chunk: get("READ_CHUNK")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(4096),

        media_dir: PathBuf::from(get("MEDIA_DIR").unwrap_or_else(|| "/data/nanocam/media".into())),
        engine,
        camera_width: get_u32("CAMERA_WIDTH", 3280),
        camera_height: get_u32("CAMERA_HEIGHT", 2464),
        framerate: get_u32("FRAMERATE", 20),
        flip_method: get_u32("FLIP_METHOD", 2),
        capture_format: get("CAPTURE_FORMAT").unwrap_or_else(|| "NV12".into()),
        sensor_id: get_u32("SENSOR_ID", 0),
        delay_frames: get_u32("DELAY_FRAMES", 20).max(1),
        video_encoder: get("VIDEO_ENCODER").unwrap_or_else(|| "nvv4l2h264enc".into()),
        frame_queue: get("FRAME_QUEUE")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(8),

        receive_dir: PathBuf::from(get("RECEIVE_DIR").unwrap_or_else(|| "./RemoteMedia".into())),
        udp_idle_timeout_secs: get_u64("UDP_IDLE_TIMEOUT_SECS", 5),
        response_timeout_secs: get_u64("RESPONSE_TIMEOUT_SECS", 0),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
