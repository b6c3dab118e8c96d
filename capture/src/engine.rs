//! The capture-engine boundary.
//!
//! A [`CaptureEngine`] owns the camera pipeline. The session layer only
//! starts it, asks it to stop, checks whether it is still running, and
//! collects what it produced. Everything about sensors, encoders and muxers
//! stays behind this trait.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use nanocam_common::artifact::MediaKind;
use nanocam_common::config::Config;
use nanocam_common::protocol::{Format, Request};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not allocate the camera or spawn its pipeline.
    #[error("capture engine unavailable: {0}")]
    Unavailable(String),

    /// The pipeline started but failed while running.
    #[error("capture failed: {0}")]
    Failed(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sensor-side configuration pushed to the engine once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub flip_method: u32,
    pub capture_format: String,
    pub sensor_id: u32,
    /// Frames captured per still so exposure can settle; the last is kept.
    pub delay_frames: u32,
    pub video_encoder: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 3280,
            height: 2464,
            framerate: 20,
            flip_method: 2,
            capture_format: "NV12".into(),
            sensor_id: 0,
            delay_frames: 20,
            video_encoder: "nvv4l2h264enc".into(),
        }
    }
}

impl CameraSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.camera_width,
            height: config.camera_height,
            framerate: config.framerate.max(1),
            flip_method: config.flip_method,
            capture_format: config.capture_format.clone(),
            sensor_id: config.sensor_id,
            delay_frames: config.delay_frames.max(1),
            video_encoder: config.video_encoder.clone(),
        }
    }
}

/// Destination of the produced media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sink {
    Memory,
    File,
    Udp,
}

impl From<Format> for Sink {
    fn from(format: Format) -> Self {
        match format {
            Format::Opencv => Self::Memory,
            Format::File => Self::File,
            Format::Udp => Self::Udp,
        }
    }
}

impl Sink {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Image { frames: u32, interval: Duration },
    /// Video runs until stopped; its duration is enforced by the session.
    Video { duration: Duration },
}

/// One capture operation as the engine sees it.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub kind: CaptureKind,
    pub sink: Sink,
    pub width: u32,
    pub height: u32,
    /// Where file artifacts are written.
    pub output_dir: PathBuf,
    /// Destination of a `udp` stream.
    pub udp_target: Option<SocketAddr>,
}

impl CaptureJob {
    /// Build the job for a capture request; `None` for control requests.
    pub fn from_request(
        request: &Request,
        output_dir: PathBuf,
        udp_target: Option<SocketAddr>,
    ) -> Option<Self> {
        let (kind, width, height, format) = match request {
            Request::Image {
                width,
                height,
                frames,
                interval,
                format,
            } => (
                CaptureKind::Image {
                    frames: *frames,
                    interval: Duration::from_secs(*interval),
                },
                *width,
                *height,
                *format,
            ),
            Request::Video {
                width,
                height,
                duration,
                format,
            } => (
                CaptureKind::Video {
                    duration: Duration::from_secs(*duration),
                },
                *width,
                *height,
                *format,
            ),
            Request::Kill | Request::ResetTimer { .. } => return None,
        };
        let sink = Sink::from(format);
        Some(Self {
            kind,
            sink,
            width,
            height,
            output_dir,
            udp_target: if sink == Sink::Udp { udp_target } else { None },
        })
    }

    pub fn media_kind(&self) -> MediaKind {
        match self.kind {
            CaptureKind::Image { .. } => MediaKind::Image,
            CaptureKind::Video { .. } => MediaKind::Video,
        }
    }
}

/// An encoded frame delivered to an in-memory sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub data: Vec<u8>,
}

/// What a finished engine run produced: file artifacts, in order.
pub type EngineOutcome = Result<Vec<PathBuf>, EngineError>;

pub trait CaptureEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Apply sensor settings for subsequent runs.
    fn configure(&self, settings: CameraSettings) -> Result<(), EngineError>;

    /// Start a capture. Returns once the pipeline is up; the run continues
    /// in the background until it completes or is stopped.
    ///
    /// `frames` is set for [`Sink::Memory`] jobs. Sends on it wait while the
    /// consumer is behind, so the engine must not hold it past the run.
    fn start(
        &self,
        job: CaptureJob,
        frames: Option<mpsc::Sender<Frame>>,
    ) -> Result<EngineHandle, EngineError>;
}

/// Session-side handle to a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    stop: CancellationToken,
    running: Arc<AtomicBool>,
    done: oneshot::Receiver<EngineOutcome>,
}

/// Engine-side counterpart of an [`EngineHandle`].
#[derive(Debug)]
pub struct EngineRunner {
    stop: CancellationToken,
    running: Arc<AtomicBool>,
    done: Option<oneshot::Sender<EngineOutcome>>,
}

/// Create a connected handle/runner pair for a new run.
pub fn engine_channel() -> (EngineHandle, EngineRunner) {
    let stop = CancellationToken::new();
    let running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = oneshot::channel();
    (
        EngineHandle {
            stop: stop.clone(),
            running: running.clone(),
            done: rx,
        },
        EngineRunner {
            stop,
            running,
            done: Some(tx),
        },
    )
}

impl EngineHandle {
    /// Ask the engine to end the run with end-of-stream. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait for the run to end. Call at most once to completion.
    pub async fn finished(&mut self) -> EngineOutcome {
        match (&mut self.done).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Failed(
                "engine ended the run without reporting".into(),
            )),
        }
    }
}

impl EngineRunner {
    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the session asked for a stop.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }

    /// Report the result of the run.
    pub fn finish(mut self, outcome: EngineOutcome) {
        self.running.store(false, Ordering::Release);
        if let Some(tx) = self.done.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for EngineRunner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_from_request() {
        let req = Request::Video {
            width: 1920,
            height: 1080,
            duration: 10,
            format: Format::Udp,
        };
        let target: SocketAddr = "192.168.1.88:5004".parse().unwrap();
        let job = CaptureJob::from_request(&req, PathBuf::from("/tmp"), Some(target)).unwrap();
        assert_eq!(job.sink, Sink::Udp);
        assert_eq!(job.udp_target, Some(target));
        assert_eq!(job.media_kind(), MediaKind::Video);
        assert_eq!(
            job.kind,
            CaptureKind::Video {
                duration: Duration::from_secs(10)
            }
        );

        let req = Request::Image {
            width: 640,
            height: 480,
            frames: 2,
            interval: 1,
            format: Format::File,
        };
        let job = CaptureJob::from_request(&req, PathBuf::from("/tmp"), Some(target)).unwrap();
        assert_eq!(job.udp_target, None);
        assert_eq!(job.media_kind(), MediaKind::Image);

        assert!(CaptureJob::from_request(&Request::Kill, PathBuf::from("/tmp"), None).is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        assert_eq!(CameraSettings::from_config(&config), CameraSettings::default());
    }

    #[tokio::test]
    async fn test_engine_channel() {
        let (mut handle, runner) = engine_channel();
        assert!(handle.is_running());
        assert!(!runner.stop_requested());

        handle.stop();
        handle.stop();
        assert!(runner.stop_requested());
        runner.stopped().await;

        runner.finish(Ok(vec![PathBuf::from("a.jpg")]));
        assert!(!handle.is_running());
        assert_eq!(handle.finished().await.unwrap(), vec![PathBuf::from("a.jpg")]);
    }

    #[tokio::test]
    async fn test_dropped_runner_reports_failure() {
        let (mut handle, runner) = engine_channel();
        drop(runner);
        assert!(!handle.is_running());
        assert!(handle.finished().await.is_err());
    }
}
