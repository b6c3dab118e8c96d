//! Session arbiter – decides whether a request may start a capture.
//!
//! The device runs at most one session. All arbiter state sits behind one
//! mutex so `busy`, `kill_requested` and the pending request always change
//! together. A watcher task per session consumes kill requests and releases
//! the device when the session ends.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use nanocam_common::artifact::MediaKind;
use nanocam_common::config::Config;
use nanocam_common::protocol::Request;

use crate::engine::{CaptureEngine, CaptureJob, CaptureKind, Sink};
use crate::session::{wait_terminal, Session, SessionError, SessionOutput, SessionStatus};

/// Identifies one client connection.
pub type ConnId = u64;

#[derive(Debug, Clone)]
pub struct ArbiterOptions {
    /// Where file artifacts are written.
    pub media_dir: PathBuf,
    /// Client port `udp` streams are sent to.
    pub media_port: u16,
    /// Capacity of the in-memory frame channel.
    pub frame_queue: usize,
}

impl ArbiterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            media_dir: config.media_dir.clone(),
            media_port: config.media_port,
            frame_queue: config.frame_queue,
        }
    }
}

/// An admitted request: the session is running and its results will
/// arrive on `output`.
#[derive(Debug)]
pub struct Admission {
    pub session_id: u64,
    pub kind: MediaKind,
    pub sink: Sink,
    pub output: SessionOutput,
}

/// How a request was handled.
#[derive(Debug)]
pub enum Disposition {
    Proceed(Admission),
    /// Another session holds the device; the request was recorded as pending.
    Busy,
    /// The device is free again. `replay` is this connection's pending
    /// request, if it had one.
    Killed { replay: Option<Request> },
    /// `applied` is false when no session was active.
    TimerReset { applied: bool },
}

struct ActiveSession {
    session: Session,
    /// Only streams are stopped by a kill; other sinks run to completion.
    preemptible: bool,
    stop_issued: bool,
}

#[derive(Default)]
struct ArbiterState {
    busy: bool,
    kill_requested: bool,
    /// Requests that got `BUSY`, by connection, replayed after a kill.
    pending: HashMap<ConnId, Request>,
    active: Option<ActiveSession>,
}

pub struct Arbiter {
    state: Mutex<ArbiterState>,
    engine: Arc<dyn CaptureEngine>,
    options: ArbiterOptions,
    kill_signal: Notify,
    idle: watch::Sender<bool>,
    /// Id of the most recently released session. Ids grow monotonically and
    /// only one session is active, so "released id >= n" means session `n`
    /// is gone no matter what was admitted since.
    released: watch::Sender<u64>,
    stops_issued: AtomicU64,
    next_conn: AtomicU64,
}

impl Arbiter {
    pub fn new(engine: Arc<dyn CaptureEngine>, options: ArbiterOptions) -> Arc<Self> {
        let (idle, _) = watch::channel(true);
        let (released, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(ArbiterState::default()),
            engine,
            options,
            kill_signal: Notify::new(),
            idle,
            released,
            stops_issued: AtomicU64::new(0),
            next_conn: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Status of the active session, `None` when idle.
    pub fn active_status(&self) -> Option<SessionStatus> {
        self.lock().active.as_ref().map(|a| a.session.status())
    }

    /// Number of stops issued on behalf of kill requests.
    pub fn stops_issued(&self) -> u64 {
        self.stops_issued.load(Ordering::Relaxed)
    }

    /// Handle one request from connection `conn`.
    ///
    /// `peer` is the client's address; `udp` streams are sent there.
    pub async fn handle_request(
        self: &Arc<Self>,
        conn: ConnId,
        request: Request,
        peer: Option<IpAddr>,
    ) -> Result<Disposition, SessionError> {
        match request {
            Request::Kill => Ok(self.kill(conn).await),
            Request::ResetTimer { duration } => Ok(Disposition::TimerReset {
                applied: self.reset_timer(Duration::from_secs(duration)),
            }),
            request => self.admit(conn, request, peer),
        }
    }

    fn admit(
        self: &Arc<Self>,
        conn: ConnId,
        request: Request,
        peer: Option<IpAddr>,
    ) -> Result<Disposition, SessionError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.busy {
            info!("Device busy – recording pending {request} from connection {conn}");
            state.pending.insert(conn, request);
            return Ok(Disposition::Busy);
        }

        let udp_target = peer.map(|ip| SocketAddr::new(ip, self.options.media_port));
        let job = CaptureJob::from_request(&request, self.options.media_dir.clone(), udp_target)
            .ok_or_else(|| SessionError::NotCapture(request.to_string()))?;
        let budget = match job.kind {
            CaptureKind::Video { duration } => Some(duration),
            CaptureKind::Image { .. } => None,
        };

        let (session, output) =
            Session::start(self.engine.as_ref(), job, self.options.frame_queue, budget)?;

        let session_id = session.id();
        let kind = session.kind();
        let sink = session.sink();
        let status = session.status_watch();

        state.busy = true;
        state.kill_requested = false;
        state.pending.remove(&conn);
        state.active = Some(ActiveSession {
            session,
            preemptible: sink == Sink::Udp,
            stop_issued: false,
        });
        self.idle.send_replace(false);
        drop(guard);

        tokio::spawn(self.clone().watch_session(session_id, status));

        Ok(Disposition::Proceed(Admission {
            session_id,
            kind,
            sink,
            output,
        }))
    }

    /// Stop the active stream and wait until that session has released the
    /// device.
    async fn kill(&self, conn: ConnId) -> Disposition {
        let (target, mut released) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some(active) = state.active.as_ref().filter(|_| state.busy) else {
                debug!("Kill from connection {conn} with no active session");
                return Disposition::Killed {
                    replay: state.pending.remove(&conn),
                };
            };

            if !active.preemptible {
                info!(
                    "Kill from connection {conn}: session {} cannot be pre-empted, waiting for it",
                    active.session.id()
                );
            } else if active.stop_issued || state.kill_requested {
                debug!("Kill from connection {conn}: session already stopping");
            } else {
                info!(
                    "Kill from connection {conn}: stopping session {}",
                    active.session.id()
                );
                state.kill_requested = true;
                self.kill_signal.notify_one();
            }
            (active.session.id(), self.released.subscribe())
        };

        let _ = released.wait_for(|id| *id >= target).await;

        Disposition::Killed {
            replay: self.lock().pending.remove(&conn),
        }
    }

    /// Re-arm the active session's deadline.
    pub fn reset_timer(&self, d: Duration) -> bool {
        match &self.lock().active {
            Some(active) => {
                info!(
                    "Session {} timer reset to {}s",
                    active.session.id(),
                    d.as_secs()
                );
                active.session.reset_expiry(d);
                true
            }
            None => {
                debug!("Timer reset with no active session – ignored");
                false
            }
        }
    }

    /// Drop any pending request recorded for a closed connection.
    pub fn forget(&self, conn: ConnId) {
        if self.lock().pending.remove(&conn).is_some() {
            debug!("Dropped pending request of connection {conn}");
        }
    }

    /// Stop the active session regardless of its sink.
    pub fn shutdown(&self) {
        if let Some(active) = &self.lock().active {
            warn!("Stopping session {} for shutdown", active.session.id());
            active.session.stop();
        }
    }

    /// Resolve once no session is active.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    // ── watcher ──────────────────────────────────────────────────────────

    async fn watch_session(
        self: Arc<Self>,
        session_id: u64,
        status: watch::Receiver<SessionStatus>,
    ) {
        let terminal = wait_terminal(status);
        tokio::pin!(terminal);

        loop {
            tokio::select! {
                status = &mut terminal => {
                    self.release(session_id, status);
                    return;
                }
                _ = self.kill_signal.notified() => self.consume_kill(session_id),
            }
        }
    }

    /// Act on a kill request at most once.
    fn consume_kill(&self, session_id: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.kill_requested {
            return;
        }
        state.kill_requested = false;

        if let Some(active) = state.active.as_mut() {
            if active.session.id() == session_id && !active.stop_issued {
                active.stop_issued = true;
                active.session.stop();
                self.stops_issued.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn release(&self, session_id: u64, status: SessionStatus) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.active.as_ref().map(|a| a.session.id()) != Some(session_id) {
            return;
        }
        state.active = None;
        state.busy = false;
        state.kill_requested = false;
        self.released.send_replace(session_id);
        self.idle.send_replace(true);
        info!("Session {session_id} {status} – device idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedEngine;
    use nanocam_common::protocol::Format;
    use std::net::{Ipv4Addr, UdpSocket};
    use tokio::time::Instant;

    const LOCALHOST: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    struct Fixture {
        arbiter: Arc<Arbiter>,
        engine: Arc<SimulatedEngine>,
        _media: tempfile::TempDir,
        _receiver: UdpSocket,
    }

    fn fixture() -> Fixture {
        let media = tempfile::tempdir().unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine = Arc::new(SimulatedEngine::new());
        let options = ArbiterOptions {
            media_dir: media.path().to_path_buf(),
            media_port: receiver.local_addr().unwrap().port(),
            frame_queue: 4,
        };
        Fixture {
            arbiter: Arbiter::new(engine.clone(), options),
            engine,
            _media: media,
            _receiver: receiver,
        }
    }

    fn stream(duration: u64) -> Request {
        Request::Video {
            width: 1280,
            height: 720,
            duration,
            format: Format::Udp,
        }
    }

    fn stills() -> Request {
        Request::Image {
            width: 640,
            height: 480,
            frames: 1,
            interval: 0,
            format: Format::File,
        }
    }

    #[tokio::test]
    async fn test_second_request_is_busy() {
        let f = fixture();
        let first = f.arbiter.handle_request(1, stream(30), LOCALHOST).await.unwrap();
        assert!(matches!(first, Disposition::Proceed(_)));
        assert!(f.arbiter.is_busy());

        let second = f.arbiter.handle_request(2, stills(), LOCALHOST).await.unwrap();
        assert!(matches!(second, Disposition::Busy));
        assert_eq!(f.arbiter.active_status(), Some(SessionStatus::Running));

        let killed = f.arbiter.handle_request(2, Request::Kill, LOCALHOST).await.unwrap();
        match killed {
            Disposition::Killed { replay } => assert_eq!(replay, Some(stills())),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!f.arbiter.is_busy());
        assert_eq!(f.arbiter.stops_issued(), 1);
    }

    #[tokio::test]
    async fn test_kill_when_idle_is_noop() {
        let f = fixture();
        let killed = f.arbiter.handle_request(1, Request::Kill, LOCALHOST).await.unwrap();
        assert!(matches!(killed, Disposition::Killed { replay: None }));
        assert_eq!(f.arbiter.stops_issued(), 0);
        assert!(!f.arbiter.is_busy());
    }

    #[tokio::test]
    async fn test_repeated_kill_stops_once() {
        let f = fixture();
        f.arbiter.handle_request(1, stream(30), LOCALHOST).await.unwrap();

        let (a, b, c) = tokio::join!(
            f.arbiter.handle_request(2, Request::Kill, LOCALHOST),
            f.arbiter.handle_request(3, Request::Kill, LOCALHOST),
            f.arbiter.handle_request(2, Request::Kill, LOCALHOST),
        );
        for d in [a, b, c] {
            assert!(matches!(d.unwrap(), Disposition::Killed { .. }));
        }
        assert_eq!(f.arbiter.stops_issued(), 1);
    }

    #[tokio::test]
    async fn test_kill_waits_for_file_session() {
        let f = fixture();
        let video = Request::Video {
            width: 1280,
            height: 720,
            duration: 1,
            format: Format::File,
        };
        let started = Instant::now();
        let Disposition::Proceed(admission) =
            f.arbiter.handle_request(1, video, LOCALHOST).await.unwrap()
        else {
            panic!("expected the session to start");
        };

        f.arbiter.handle_request(2, Request::Kill, LOCALHOST).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(f.arbiter.stops_issued(), 0);

        let outcome = admission.output.outcome.await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_expires() {
        let f = fixture();
        f.arbiter.handle_request(1, stream(1), LOCALHOST).await.unwrap();
        assert!(f.arbiter.is_busy());

        tokio::time::timeout(Duration::from_secs(5), f.arbiter.wait_idle())
            .await
            .unwrap();
        assert!(!f.arbiter.is_busy());
        assert_eq!(f.arbiter.stops_issued(), 0);
    }

    #[tokio::test]
    async fn test_reset_timer() {
        let f = fixture();
        let reset = f
            .arbiter
            .handle_request(1, Request::ResetTimer { duration: 5 }, LOCALHOST)
            .await
            .unwrap();
        assert!(matches!(reset, Disposition::TimerReset { applied: false }));

        f.arbiter.handle_request(1, stream(1), LOCALHOST).await.unwrap();
        let reset = f
            .arbiter
            .handle_request(1, Request::ResetTimer { duration: 30 }, LOCALHOST)
            .await
            .unwrap();
        assert!(matches!(reset, Disposition::TimerReset { applied: true }));

        // the first one-second deadline no longer applies
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(f.arbiter.is_busy());
        f.arbiter.shutdown();
        f.arbiter.wait_idle().await;
    }

    #[tokio::test]
    async fn test_engine_unavailable() {
        let f = fixture();
        f.engine.set_available(false);
        let err = f
            .arbiter
            .handle_request(1, stills(), LOCALHOST)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::EngineUnavailable(_)));
        assert!(!f.arbiter.is_busy());

        f.engine.set_available(true);
        let ok = f.arbiter.handle_request(1, stills(), LOCALHOST).await.unwrap();
        assert!(matches!(ok, Disposition::Proceed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_huge_durations_keep_session_tracked() {
        let f = fixture();
        let first = f
            .arbiter
            .handle_request(1, stream(u64::MAX), LOCALHOST)
            .await
            .unwrap();
        assert!(matches!(first, Disposition::Proceed(_)));
        assert!(f.arbiter.is_busy());

        let reset = f
            .arbiter
            .handle_request(1, Request::ResetTimer { duration: u64::MAX }, LOCALHOST)
            .await
            .unwrap();
        assert!(matches!(reset, Disposition::TimerReset { applied: true }));

        let second = f.arbiter.handle_request(2, stream(30), LOCALHOST).await.unwrap();
        assert!(matches!(second, Disposition::Busy));
        assert_eq!(f.arbiter.active_status(), Some(SessionStatus::Running));

        let killed = f.arbiter.handle_request(2, Request::Kill, LOCALHOST).await.unwrap();
        assert!(matches!(killed, Disposition::Killed { replay: Some(_) }));
        assert_eq!(f.arbiter.stops_issued(), 1);
    }

    #[tokio::test]
    async fn test_kill_returns_when_device_is_taken_again() {
        let f = fixture();
        f.arbiter.handle_request(1, stream(30), LOCALHOST).await.unwrap();

        let kill = f.arbiter.handle_request(2, Request::Kill, LOCALHOST);
        tokio::pin!(kill);
        // poll once so the kill is registered, then leave it parked
        tokio::select! {
            biased;
            _ = &mut kill => panic!("kill finished before the stream stopped"),
            _ = async {} => {}
        }

        tokio::time::timeout(Duration::from_secs(5), f.arbiter.wait_idle())
            .await
            .unwrap();
        let next = f.arbiter.handle_request(3, stream(30), LOCALHOST).await.unwrap();
        assert!(matches!(next, Disposition::Proceed(_)));
        assert!(f.arbiter.is_busy());

        let killed = tokio::time::timeout(Duration::from_secs(2), kill)
            .await
            .expect("kill waited on the next session")
            .unwrap();
        assert!(matches!(killed, Disposition::Killed { replay: None }));
        assert_eq!(f.arbiter.stops_issued(), 1);
        assert!(f.arbiter.is_busy());

        f.arbiter.shutdown();
        f.arbiter.wait_idle().await;
    }

    #[tokio::test]
    async fn test_forget_drops_pending() {
        let f = fixture();
        f.arbiter.handle_request(1, stream(30), LOCALHOST).await.unwrap();
        f.arbiter.handle_request(2, stills(), LOCALHOST).await.unwrap();
        f.arbiter.forget(2);

        let killed = f.arbiter.handle_request(2, Request::Kill, LOCALHOST).await.unwrap();
        assert!(matches!(killed, Disposition::Killed { replay: None }));
    }
}
