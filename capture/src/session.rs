//! Capture session – one running or pending capture operation.
//!
//! A session owns its engine handle through a background driver task. The
//! driver waits for whichever comes first: the engine finishing, a stop
//! request, or the expiry deadline. Deadlines live here and are never pushed
//! into the engine configuration.

use std::fmt;
use std::future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nanocam_common::artifact::MediaKind;

use crate::engine::{CaptureEngine, CaptureJob, CaptureKind, EngineError, EngineHandle, Frame, Sink};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("engine unavailable: {0}")]
    EngineUnavailable(#[source] EngineError),

    #[error("not a capture request: {0}")]
    NotCapture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, engine not up yet.
    Pending,
    Running,
    Completed,
    Killed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Killed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Killed => "killed",
        })
    }
}

/// Final report of a session, sent once by its driver.
#[derive(Debug)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    /// File artifacts in production order; empty for memory and udp sinks.
    pub artifacts: Vec<PathBuf>,
    /// Set when the engine failed mid-run.
    pub error: Option<EngineError>,
}

/// Consumer side of a session's results.
#[derive(Debug)]
pub struct SessionOutput {
    pub outcome: oneshot::Receiver<SessionOutcome>,
    /// In-memory frames, for [`Sink::Memory`] sessions.
    pub frames: Option<mpsc::Receiver<Frame>>,
}

/// Handle to a capture session. Dropping it does not stop the capture.
#[derive(Debug)]
pub struct Session {
    id: u64,
    kind: MediaKind,
    capture: CaptureKind,
    resolution: (u32, u32),
    sink: Sink,
    started_at: DateTime<Local>,
    cancel: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
    status: watch::Receiver<SessionStatus>,
}

impl Session {
    /// Start `job` on `engine`. Returns once the engine pipeline is up,
    /// with `expiry` (if any) already armed.
    pub fn start(
        engine: &dyn CaptureEngine,
        job: CaptureJob,
        frame_queue: usize,
        expiry: Option<Duration>,
    ) -> Result<(Session, SessionOutput), SessionError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let kind = job.media_kind();
        let capture = job.kind;
        let resolution = (job.width, job.height);
        let sink = job.sink;
        let (status_tx, status_rx) = watch::channel(SessionStatus::Pending);

        let (frame_tx, frame_rx) = if sink == Sink::Memory {
            let (tx, rx) = mpsc::channel(frame_queue.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handle = engine
            .start(job, frame_tx)
            .map_err(SessionError::EngineUnavailable)?;
        status_tx.send_replace(SessionStatus::Running);

        let cancel = CancellationToken::new();
        let (deadline_tx, deadline_rx) = watch::channel(expiry.and_then(deadline_after));
        let (outcome_tx, outcome_rx) = oneshot::channel();

        info!(
            "Session {id} running: {} via {} ({})",
            kind.as_str(),
            sink.as_str(),
            engine.name()
        );
        tokio::spawn(drive(Driver {
            id,
            handle,
            cancel: cancel.clone(),
            deadline: deadline_rx,
            expiry_kills: sink == Sink::Udp,
            status: status_tx,
            outcome: outcome_tx,
        }));

        let session = Session {
            id,
            kind,
            capture,
            resolution,
            sink,
            started_at: Local::now(),
            cancel,
            deadline: deadline_tx,
            status: status_rx,
        };
        let output = SessionOutput {
            outcome: outcome_rx,
            frames: frame_rx,
        };
        Ok((session, output))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Frame count or duration requested.
    pub fn capture(&self) -> CaptureKind {
        self.capture
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn sink(&self) -> Sink {
        self.sink
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Graceful stop (end-of-stream). Idempotent; the session ends `Killed`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Arm a deadline `d` from now. A deadline beyond what the clock can
    /// represent leaves the session without one.
    pub fn set_expiry(&self, d: Duration) {
        self.deadline.send_replace(deadline_after(d));
    }

    /// Replace the deadline with `d` measured from now.
    pub fn reset_expiry(&self, d: Duration) {
        debug!("Session {} expiry reset to {}s", self.id, d.as_secs());
        self.set_expiry(d);
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the session is `Completed` or `Killed`.
    pub async fn wait(&self) -> SessionStatus {
        wait_terminal(self.status.clone()).await
    }
}

fn deadline_after(d: Duration) -> Option<Instant> {
    let at = Instant::now().checked_add(d);
    if at.is_none() {
        warn!("Expiry of {}s is out of range – no deadline armed", d.as_secs());
    }
    at
}

/// Resolve once `rx` reports a terminal status.
pub async fn wait_terminal(mut rx: watch::Receiver<SessionStatus>) -> SessionStatus {
    loop {
        let status = *rx.borrow_and_update();
        if status.is_terminal() {
            return status;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

// ── driver ───────────────────────────────────────────────────────────────

struct Driver {
    id: u64,
    handle: EngineHandle,
    cancel: CancellationToken,
    deadline: watch::Receiver<Option<Instant>>,
    /// Expiry counts as a kill (streams) rather than an exhausted budget.
    expiry_kills: bool,
    status: watch::Sender<SessionStatus>,
    outcome: oneshot::Sender<SessionOutcome>,
}

enum Wake {
    Finished(Result<Vec<PathBuf>, EngineError>),
    Cancelled,
    Expired,
    DeadlineChanged,
    DeadlineDropped,
}

async fn drive(mut d: Driver) {
    let mut watching = true;

    let (status, result) = loop {
        let deadline = *d.deadline.borrow_and_update();
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        let wake = tokio::select! {
            result = d.handle.finished() => Wake::Finished(result),
            _ = d.cancel.cancelled() => Wake::Cancelled,
            _ = expiry => Wake::Expired,
            changed = d.deadline.changed(), if watching => match changed {
                Ok(()) => Wake::DeadlineChanged,
                Err(_) => Wake::DeadlineDropped,
            },
        };

        match wake {
            Wake::Finished(result) => break (SessionStatus::Completed, result),
            Wake::Cancelled => {
                info!("Session {} stopping on request", d.id);
                d.handle.stop();
                break (SessionStatus::Killed, d.handle.finished().await);
            }
            Wake::Expired => {
                let status = if d.expiry_kills {
                    SessionStatus::Killed
                } else {
                    SessionStatus::Completed
                };
                info!("Session {} reached its deadline ({status})", d.id);
                d.handle.stop();
                break (status, d.handle.finished().await);
            }
            Wake::DeadlineChanged => continue,
            Wake::DeadlineDropped => watching = false,
        }
    };

    let (artifacts, error) = match result {
        Ok(artifacts) => (artifacts, None),
        Err(e) => {
            warn!("Session {} engine error: {e}", d.id);
            (Vec::new(), Some(e))
        }
    };
    info!(
        "Session {} {status} with {} artifact(s)",
        d.id,
        artifacts.len()
    );

    let _ = d.outcome.send(SessionOutcome {
        status,
        artifacts,
        error,
    });
    d.status.send_replace(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedEngine;

    fn udp_job(target: std::net::SocketAddr) -> CaptureJob {
        CaptureJob {
            kind: CaptureKind::Video {
                duration: Duration::from_secs(10),
            },
            sink: Sink::Udp,
            width: 1280,
            height: 720,
            output_dir: PathBuf::from("."),
            udp_target: Some(target),
        }
    }

    fn video_file_job(dir: &std::path::Path) -> CaptureJob {
        CaptureJob {
            kind: CaptureKind::Video {
                duration: Duration::from_secs(1),
            },
            sink: Sink::File,
            width: 1280,
            height: 720,
            output_dir: dir.to_path_buf(),
            udp_target: None,
        }
    }

    #[tokio::test]
    async fn test_image_session_completes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new();
        let job = CaptureJob {
            kind: CaptureKind::Image {
                frames: 2,
                interval: Duration::ZERO,
            },
            sink: Sink::File,
            width: 640,
            height: 480,
            output_dir: dir.path().to_path_buf(),
            udp_target: None,
        };
        let (session, output) = Session::start(&engine, job, 4, None).unwrap();
        assert_eq!(session.kind(), MediaKind::Image);
        assert_eq!(session.resolution(), (640, 480));
        assert!(matches!(session.capture(), CaptureKind::Image { frames: 2, .. }));
        assert_eq!(session.wait().await, SessionStatus::Completed);

        let outcome = output.outcome.await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.artifacts.len(), 2);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine = SimulatedEngine::new();
        let (session, output) =
            Session::start(&engine, udp_job(sink.local_addr().unwrap()), 4, None).unwrap();
        assert_eq!(session.status(), SessionStatus::Running);

        session.stop();
        session.stop();
        assert_eq!(session.wait().await, SessionStatus::Killed);
        assert_eq!(output.outcome.await.unwrap().status, SessionStatus::Killed);
        session.stop();
        assert_eq!(session.status(), SessionStatus::Killed);
    }

    #[tokio::test]
    async fn test_udp_expiry_kills() {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine = SimulatedEngine::new();
        let (session, _output) =
            Session::start(&engine, udp_job(sink.local_addr().unwrap()), 4, None).unwrap();

        let started = Instant::now();
        session.set_expiry(Duration::from_millis(200));
        assert_eq!(session.wait().await, SessionStatus::Killed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_reset_moves_deadline() {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine = SimulatedEngine::new();
        let (session, _output) =
            Session::start(&engine, udp_job(sink.local_addr().unwrap()), 4, None).unwrap();

        session.set_expiry(Duration::from_millis(300));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let reset_at = Instant::now();
        session.reset_expiry(Duration::from_millis(600));

        // past the first deadline
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.status(), SessionStatus::Running);

        assert_eq!(session.wait().await, SessionStatus::Killed);
        assert!(reset_at.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_budget_expiry_completes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new();
        let (session, output) = Session::start(
            &engine,
            video_file_job(dir.path()),
            4,
            Some(Duration::from_millis(150)),
        )
        .unwrap();
        assert!(session.deadline().is_some());

        assert_eq!(session.wait().await, SessionStatus::Completed);
        let outcome = output.outcome.await.unwrap();
        assert_eq!(outcome.artifacts.len(), 1);
        assert!(outcome.artifacts[0].exists());
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_is_ignored() {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine = SimulatedEngine::new();
        let (session, _output) = Session::start(
            &engine,
            udp_job(sink.local_addr().unwrap()),
            4,
            Some(Duration::MAX),
        )
        .unwrap();
        assert_eq!(session.deadline(), None);

        session.set_expiry(Duration::from_secs(u64::MAX));
        session.reset_expiry(Duration::MAX);
        assert_eq!(session.deadline(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.status(), SessionStatus::Running);

        // a representable deadline still works afterwards
        session.reset_expiry(Duration::from_millis(100));
        assert_eq!(session.wait().await, SessionStatus::Killed);
    }

    #[tokio::test]
    async fn test_memory_session_frames() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new();
        let job = CaptureJob {
            kind: CaptureKind::Image {
                frames: 3,
                interval: Duration::ZERO,
            },
            sink: Sink::Memory,
            width: 640,
            height: 480,
            output_dir: dir.path().to_path_buf(),
            udp_target: None,
        };
        let (session, output) = Session::start(&engine, job, 1, None).unwrap();
        let mut frames = output.frames.unwrap();
        let mut count = 0;
        while frames.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(session.wait().await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_engine_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new();
        engine.set_available(false);
        let err = Session::start(&engine, video_file_job(dir.path()), 4, None).unwrap_err();
        assert!(matches!(err, SessionError::EngineUnavailable(_)));
    }
}
