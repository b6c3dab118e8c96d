//! Simulated capture engine – produces placeholder media without a camera.
//!
//! Used on development machines and by the integration tests. Timing follows
//! the request (frame intervals, stream frame rate) so sessions behave like
//! the real pipeline from the arbiter's point of view.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use nanocam_common::artifact::{artifact_name, MediaKind};

use crate::engine::{
    engine_channel, CameraSettings, CaptureEngine, CaptureJob, CaptureKind, EngineError,
    EngineHandle, EngineOutcome, EngineRunner, Frame, Sink,
};

pub struct SimulatedEngine {
    settings: Mutex<CameraSettings>,
    available: AtomicBool,
    seq: Arc<AtomicU32>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            settings: Mutex::new(CameraSettings::default()),
            available: AtomicBool::new(true),
            seq: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make subsequent starts fail with [`EngineError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn settings(&self) -> CameraSettings {
        match self.settings.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CaptureEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn configure(&self, settings: CameraSettings) -> Result<(), EngineError> {
        debug!(
            "Simulated camera configured: {}x{} @ {} fps",
            settings.width, settings.height, settings.framerate
        );
        match self.settings.lock() {
            Ok(mut s) => *s = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        Ok(())
    }

    fn start(
        &self,
        job: CaptureJob,
        frames: Option<mpsc::Sender<Frame>>,
    ) -> Result<EngineHandle, EngineError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(EngineError::Unavailable("simulated camera is offline".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Unavailable(format!("no async runtime: {e}")))?;
        if job.sink == Sink::Udp && job.udp_target.is_none() {
            return Err(EngineError::Unavailable("udp stream without a target".into()));
        }
        if job.sink == Sink::Memory && frames.is_none() {
            return Err(EngineError::Unavailable("in-memory capture without a frame channel".into()));
        }

        let settings = self.settings();
        let seq = self.seq.clone();
        let (handle, runner) = engine_channel();

        info!(
            "Simulated {} capture started ({}x{}, sink={})",
            job.media_kind().as_str(),
            job.width,
            job.height,
            job.sink.as_str()
        );
        runtime.spawn(async move {
            let outcome = run(&job, &settings, frames, &runner, &seq).await;
            if let Err(e) = &outcome {
                debug!("Simulated capture ended with error: {e}");
            }
            runner.finish(outcome);
        });
        Ok(handle)
    }
}

async fn run(
    job: &CaptureJob,
    settings: &CameraSettings,
    frames: Option<mpsc::Sender<Frame>>,
    runner: &EngineRunner,
    seq: &AtomicU32,
) -> EngineOutcome {
    let period = Duration::from_millis((1000 / u64::from(settings.framerate.max(1))).max(1));

    match job.kind {
        CaptureKind::Image { frames: count, interval } => {
            let mut produced = Vec::new();
            for i in 0..count {
                if i > 0 {
                    tokio::select! {
                        _ = runner.stopped() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                let name = artifact_name(MediaKind::Image, Local::now(), next_seq(seq));
                let data = placeholder_jpeg(job.width, job.height, i);
                match &frames {
                    Some(tx) => {
                        if !deliver(tx, Frame { name, data }, runner).await {
                            break;
                        }
                    }
                    None => produced.push(write_artifact(job, &name, &data).await?),
                }
            }
            Ok(produced)
        }
        CaptureKind::Video { .. } => match job.sink {
            Sink::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                let Some(target) = job.udp_target else {
                    return Err(EngineError::Failed("udp stream without a target".into()));
                };
                let mut ticker = tokio::time::interval(period);
                let mut sent = 0u64;
                loop {
                    tokio::select! {
                        _ = runner.stopped() => break,
                        _ = ticker.tick() => {
                            let packet = placeholder_rtp(sent);
                            if let Err(e) = socket.send_to(&packet, target).await {
                                debug!("udp send to {target} failed: {e}");
                            }
                            sent += 1;
                        }
                    }
                }
                debug!("Simulated stream sent {sent} datagrams to {target}");
                Ok(Vec::new())
            }
            Sink::File => {
                let started = tokio::time::Instant::now();
                runner.stopped().await;
                let frame_count = started.elapsed().as_millis() / period.as_millis().max(1);
                let name = artifact_name(MediaKind::Video, Local::now(), next_seq(seq));
                let data = placeholder_mp4(frame_count as usize);
                Ok(vec![write_artifact(job, &name, &data).await?])
            }
            Sink::Memory => {
                let Some(tx) = &frames else {
                    return Ok(Vec::new());
                };
                let mut ticker = tokio::time::interval(period);
                let mut index = 0u32;
                loop {
                    tokio::select! {
                        _ = runner.stopped() => break,
                        _ = ticker.tick() => {
                            let name = artifact_name(MediaKind::Image, Local::now(), next_seq(seq));
                            let data = placeholder_jpeg(job.width, job.height, index);
                            if !deliver(tx, Frame { name, data }, runner).await {
                                break;
                            }
                            index += 1;
                        }
                    }
                }
                Ok(Vec::new())
            }
        },
    }
}

/// Push a frame, waiting while the channel is full. `false` once the
/// consumer is gone or a stop was requested.
async fn deliver(tx: &mpsc::Sender<Frame>, frame: Frame, runner: &EngineRunner) -> bool {
    tokio::select! {
        _ = runner.stopped() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}

async fn write_artifact(job: &CaptureJob, name: &str, data: &[u8]) -> Result<PathBuf, EngineError> {
    let path = job.output_dir.join(name);
    tokio::fs::write(&path, data).await?;
    debug!("Wrote {} ({} bytes)", path.display(), data.len());
    Ok(path)
}

fn next_seq(seq: &AtomicU32) -> u32 {
    seq.fetch_add(1, Ordering::Relaxed) % 1000
}

// ── placeholder media ────────────────────────────────────────────────────

fn placeholder_jpeg(width: u32, height: u32, index: u32) -> Vec<u8> {
    let comment = format!("nanocam {width}x{height} frame {index}");
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xFE];
    data.extend_from_slice(&((comment.len() + 2) as u16).to_be_bytes());
    data.extend_from_slice(comment.as_bytes());
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

fn placeholder_mp4(frame_count: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + frame_count);
    data.extend_from_slice(&24u32.to_be_bytes());
    data.extend_from_slice(b"ftypisom");
    data.extend_from_slice(&0x200u32.to_be_bytes());
    data.extend_from_slice(b"isommp42");
    data.extend_from_slice(&((8 + frame_count) as u32).to_be_bytes());
    data.extend_from_slice(b"mdat");
    data.resize(data.len() + frame_count, 0);
    data
}

fn placeholder_rtp(seq: u64) -> Vec<u8> {
    // RTP v2, dynamic payload type 96
    let mut packet = vec![0x80, 96];
    packet.extend_from_slice(&(seq as u16).to_be_bytes());
    packet.extend_from_slice(&((seq * 4500) as u32).to_be_bytes());
    packet.extend_from_slice(&0x4E43_414Du32.to_be_bytes());
    packet.extend_from_slice(&[0u8; 32]);
    packet
}
