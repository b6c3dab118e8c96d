//! Camera capture – spawns `gst-launch-1.0` pipelines as child processes.
//!
//! Each run owns one worker thread that waits on the child, forwards a stop
//! request as SIGINT (pipelines are launched with `-e`, so they finish with
//! end-of-stream and a valid container), and reports the artifacts.

use std::fs;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nanocam_common::artifact::{artifact_name, MediaKind};

use crate::engine::{
    engine_channel, CameraSettings, CaptureEngine, CaptureJob, CaptureKind, EngineError,
    EngineHandle, EngineOutcome, EngineRunner, Frame, Sink,
};

const LAUNCHER: &str = "gst-launch-1.0";
const POLL: Duration = Duration::from_millis(100);
/// How long a pipeline may take to drain after SIGINT before it is killed.
const EOS_GRACE: Duration = Duration::from_secs(5);

pub struct GstEngine {
    launcher: String,
    settings: Mutex<CameraSettings>,
    /// Result of the last launcher check, `None` until one has run.
    launcher_check: Mutex<Option<Result<(), String>>>,
    seq: Arc<AtomicU32>,
}

impl Default for GstEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GstEngine {
    pub fn new() -> Self {
        Self::with_launcher(LAUNCHER)
    }

    /// Use a different `gst-launch` binary.
    pub fn with_launcher(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
            settings: Mutex::new(CameraSettings::default()),
            launcher_check: Mutex::new(None),
            seq: Arc::new(AtomicU32::new(0)),
        }
    }

    fn settings(&self) -> CameraSettings {
        match self.settings.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run `<launcher> --version` and remember the result. Stills spawn
    /// their pipelines later, on the worker, so a missing install has to be
    /// known before then.
    fn check_launcher(&self) -> Result<(), String> {
        let result = match Command::new(&self.launcher)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("{} --version exited with {status}", self.launcher)),
            Err(e) => Err(format!("cannot run {}: {e}", self.launcher)),
        };
        let mut cached = match self.launcher_check.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cached = Some(result.clone());
        result
    }

    /// The remembered launcher check, running it only if none has run yet.
    fn launcher_ready(&self) -> Result<(), EngineError> {
        let cached = match self.launcher_check.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        cached
            .unwrap_or_else(|| self.check_launcher())
            .map_err(EngineError::Unavailable)
    }
}

impl CaptureEngine for GstEngine {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn configure(&self, settings: CameraSettings) -> Result<(), EngineError> {
        info!(
            "Camera: sensor {} at {}x{} {} @ {} fps, flip-method {}, {} warm-up frame(s)",
            settings.sensor_id,
            settings.width,
            settings.height,
            settings.capture_format,
            settings.framerate,
            settings.flip_method,
            settings.delay_frames
        );
        match self.settings.lock() {
            Ok(mut s) => *s = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        // captures report the failure per request; the server still starts
        if let Err(e) = self.check_launcher() {
            warn!("Camera pipelines unavailable: {e}");
        }
        Ok(())
    }

    fn start(
        &self,
        job: CaptureJob,
        frames: Option<mpsc::Sender<Frame>>,
    ) -> Result<EngineHandle, EngineError> {
        let settings = self.settings();
        let (handle, runner) = engine_channel();

        match (job.kind, job.sink) {
            (CaptureKind::Image { frames: count, interval }, _) => {
                self.launcher_ready()?;
                let stills = Stills {
                    launcher: self.launcher.clone(),
                    settings,
                    seq: self.seq.clone(),
                };
                spawn_worker("gst-stills", runner, move |runner| {
                    stills.run(&job, count, interval, frames, runner)
                })?;
            }
            (CaptureKind::Video { .. }, Sink::File) => {
                let name = artifact_name(MediaKind::Video, Local::now(), next_seq(&self.seq));
                let path = job.output_dir.join(name);
                let args = video_file_args(&settings, job.width, job.height, &path);
                let mut child = spawn_pipeline(&self.launcher, &args, "video")?;
                spawn_worker("gst-video", runner, move |runner| {
                    let status = wait_child(&mut child, runner)?;
                    check_status(status, runner)?;
                    if path.exists() {
                        Ok(vec![path])
                    } else {
                        Err(EngineError::Failed(format!(
                            "pipeline exited with {status} without writing {}",
                            path.display()
                        )))
                    }
                })?;
            }
            (CaptureKind::Video { .. }, Sink::Udp) => {
                let target = job.udp_target.ok_or_else(|| {
                    EngineError::Unavailable("udp stream without a target".into())
                })?;
                let args = udp_args(&settings, job.width, job.height, target);
                let mut child = spawn_pipeline(&self.launcher, &args, "stream")?;
                info!("Streaming to {target}");
                spawn_worker("gst-stream", runner, move |runner| {
                    let status = wait_child(&mut child, runner)?;
                    check_status(status, runner)?;
                    Ok(Vec::new())
                })?;
            }
            (CaptureKind::Video { .. }, Sink::Memory) => {
                let tx = frames.ok_or_else(|| {
                    EngineError::Unavailable("in-memory capture without a frame channel".into())
                })?;
                let scratch = job
                    .output_dir
                    .join(format!(".frames-{:03}", next_seq(&self.seq)));
                fs::create_dir_all(&scratch)?;
                let args = frame_args(&settings, job.width, job.height, &scratch);
                let mut child = spawn_pipeline(&self.launcher, &args, "frames")?;
                let seq = self.seq.clone();
                spawn_worker("gst-frames", runner, move |runner| {
                    let result = forward_frames(&mut child, &scratch, &tx, &seq, runner);
                    let _ = fs::remove_dir_all(&scratch);
                    result.map(|()| Vec::new())
                })?;
            }
        }
        Ok(handle)
    }
}

fn spawn_worker<F>(name: &str, runner: EngineRunner, work: F) -> Result<(), EngineError>
where
    F: FnOnce(&EngineRunner) -> EngineOutcome + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let outcome = work(&runner);
            runner.finish(outcome);
        })
        .map(|_| ())
        .map_err(|e| EngineError::Unavailable(format!("cannot spawn {name} worker: {e}")))
}

fn next_seq(seq: &AtomicU32) -> u32 {
    seq.fetch_add(1, Ordering::Relaxed) % 1000
}

// ── stills ───────────────────────────────────────────────────────────────

struct Stills {
    launcher: String,
    settings: CameraSettings,
    seq: Arc<AtomicU32>,
}

impl Stills {
    fn run(
        &self,
        job: &CaptureJob,
        count: u32,
        interval: Duration,
        frames: Option<mpsc::Sender<Frame>>,
        runner: &EngineRunner,
    ) -> EngineOutcome {
        let mut produced = Vec::new();
        for i in 0..count {
            if i > 0 && !sleep_unless_stopped(interval, runner) {
                break;
            }
            if runner.stop_requested() {
                break;
            }

            let name = artifact_name(MediaKind::Image, Local::now(), next_seq(&self.seq));
            let path = self.capture(job, &name, runner)?;
            match &frames {
                Some(tx) => {
                    let data = fs::read(&path)?;
                    let _ = fs::remove_file(&path);
                    if tx.blocking_send(Frame { name, data }).is_err() {
                        debug!("Frame consumer gone – ending stills");
                        break;
                    }
                }
                None => produced.push(path),
            }
        }
        Ok(produced)
    }

    /// Capture one still into `output_dir/name`, keeping the last warm-up frame.
    fn capture(
        &self,
        job: &CaptureJob,
        name: &str,
        runner: &EngineRunner,
    ) -> Result<PathBuf, EngineError> {
        let scratch = job
            .output_dir
            .join(format!(".warmup-{:03}", next_seq(&self.seq)));
        fs::create_dir_all(&scratch)?;

        let args = still_args(&self.settings, job.width, job.height, &scratch);
        let result = spawn_pipeline(&self.launcher, &args, "still")
            .and_then(|mut child| wait_child(&mut child, runner))
            .and_then(|status| check_status(status, runner))
            .and_then(|()| keep_last_frame(&scratch, &job.output_dir.join(name)));

        let _ = fs::remove_dir_all(&scratch);
        result
    }
}

fn keep_last_frame(scratch: &Path, dest: &Path) -> Result<PathBuf, EngineError> {
    let last = frame_files(scratch)?
        .pop()
        .ok_or_else(|| EngineError::Failed("pipeline produced no frames".into()))?;
    fs::rename(&last, dest)?;
    debug!("Kept {} as {}", last.display(), dest.display());
    Ok(dest.to_path_buf())
}

fn sleep_unless_stopped(d: Duration, runner: &EngineRunner) -> bool {
    let until = Instant::now().checked_add(d);
    loop {
        if runner.stop_requested() {
            return false;
        }
        let now = Instant::now();
        match until {
            Some(until) if now >= until => return true,
            Some(until) => thread::sleep(POLL.min(until - now)),
            None => thread::sleep(POLL),
        }
    }
}

// ── in-memory frames ─────────────────────────────────────────────────────

fn forward_frames(
    child: &mut Child,
    scratch: &Path,
    tx: &mpsc::Sender<Frame>,
    seq: &AtomicU32,
    runner: &EngineRunner,
) -> Result<(), EngineError> {
    let mut stop = StopState::default();
    let mut consumer_gone = false;
    loop {
        let exited = child.try_wait()?;
        let mut ready = frame_files(scratch)?;
        if exited.is_none() {
            // the newest file may still be written
            ready.pop();
        }
        for path in ready {
            let data = fs::read(&path)?;
            fs::remove_file(&path)?;
            if consumer_gone {
                continue;
            }
            let name = artifact_name(MediaKind::Image, Local::now(), next_seq(seq));
            if tx.blocking_send(Frame { name, data }).is_err() {
                debug!("Frame consumer gone – stopping pipeline");
                consumer_gone = true;
            }
        }

        if let Some(status) = exited {
            return check_status(status, runner);
        }
        stop.poll(child, runner.stop_requested() || consumer_gone);
        thread::sleep(POLL);
    }
}

fn frame_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "jpg"))
        .collect();
    files.sort();
    Ok(files)
}

// ── child processes ──────────────────────────────────────────────────────

fn spawn_pipeline(launcher: &str, args: &[String], tag: &str) -> Result<Child, EngineError> {
    info!("Spawning: {launcher} -e {}", args.join(" "));

    let mut child = Command::new(launcher)
        .arg("-e")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::Unavailable(format!("Failed to spawn {launcher}: {e}")))?;

    // Drain stderr so pipeline errors show up in the log and the pipe
    // never fills.
    if let Some(stderr) = child.stderr.take() {
        let tag = tag.to_string();
        thread::Builder::new()
            .name(format!("gst-{tag}-stderr"))
            .spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(l) if l.is_empty() => {}
                        Ok(l) => warn!("[gst {tag}] {l}"),
                        Err(_) => break,
                    }
                }
                debug!("gst {tag} stderr stream ended");
            })
            .ok();
    }

    debug!("{launcher} started (pid={})", child.id());
    Ok(child)
}

/// Escalation from SIGINT (end-of-stream) to SIGKILL.
#[derive(Default)]
struct StopState {
    interrupted_at: Option<Instant>,
    killed: bool,
}

impl StopState {
    fn poll(&mut self, child: &mut Child, stop: bool) {
        match self.interrupted_at {
            None if stop => {
                interrupt(child);
                self.interrupted_at = Some(Instant::now());
            }
            Some(at) if !self.killed && at.elapsed() > EOS_GRACE => {
                warn!("Pipeline {} ignored SIGINT – killing it", child.id());
                let _ = child.kill();
                self.killed = true;
            }
            _ => {}
        }
    }
}

fn interrupt(child: &Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: plain signal delivery to a child we spawned and have not reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        warn!(
            "Cannot signal pipeline {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn wait_child(child: &mut Child, runner: &EngineRunner) -> Result<ExitStatus, EngineError> {
    let mut stop = StopState::default();
    loop {
        if let Some(status) = child.try_wait()? {
            debug!("Pipeline {} exited with {status}", child.id());
            return Ok(status);
        }
        stop.poll(child, runner.stop_requested());
        thread::sleep(POLL);
    }
}

/// A non-zero exit is only an error when nobody asked the pipeline to stop.
fn check_status(status: ExitStatus, runner: &EngineRunner) -> Result<(), EngineError> {
    if status.success() || runner.stop_requested() {
        Ok(())
    } else {
        Err(EngineError::Failed(format!("pipeline exited with {status}")))
    }
}

// ── pipeline descriptions ────────────────────────────────────────────────

fn source_args(s: &CameraSettings, width: u32, height: u32, num_buffers: Option<u32>) -> Vec<String> {
    let mut args = vec!["nvarguscamerasrc".to_string(), format!("sensor-id={}", s.sensor_id)];
    if let Some(n) = num_buffers {
        args.push(format!("num-buffers={n}"));
    }
    args.extend([
        "!".to_string(),
        format!(
            "video/x-raw(memory:NVMM),width={},height={},format={},framerate={}/1",
            s.width, s.height, s.capture_format, s.framerate
        ),
        "!".to_string(),
        "nvvidconv".to_string(),
        format!("flip-method={}", s.flip_method),
        "!".to_string(),
        format!("video/x-raw(memory:NVMM),width={width},height={height}"),
        "!".to_string(),
    ]);
    args
}

fn location(path: &Path) -> String {
    format!("location={}", path.display())
}

fn still_args(s: &CameraSettings, width: u32, height: u32, scratch: &Path) -> Vec<String> {
    let mut args = source_args(s, width, height, Some(s.delay_frames.max(1)));
    args.extend([
        "nvjpegenc".to_string(),
        "!".to_string(),
        "multifilesink".to_string(),
        location(&scratch.join("frame-%05d.jpg")),
    ]);
    args
}

fn frame_args(s: &CameraSettings, width: u32, height: u32, scratch: &Path) -> Vec<String> {
    let mut args = source_args(s, width, height, None);
    args.extend([
        "nvjpegenc".to_string(),
        "!".to_string(),
        "multifilesink".to_string(),
        location(&scratch.join("frame-%08d.jpg")),
    ]);
    args
}

fn video_file_args(s: &CameraSettings, width: u32, height: u32, path: &Path) -> Vec<String> {
    let mut args = source_args(s, width, height, None);
    args.extend([
        s.video_encoder.clone(),
        "!".to_string(),
        "h264parse".to_string(),
        "!".to_string(),
        "qtmux".to_string(),
        "!".to_string(),
        "filesink".to_string(),
        location(path),
    ]);
    args
}

fn udp_args(s: &CameraSettings, width: u32, height: u32, target: SocketAddr) -> Vec<String> {
    let mut args = source_args(s, width, height, None);
    args.extend([
        s.video_encoder.clone(),
        "!".to_string(),
        "h264parse".to_string(),
        "!".to_string(),
        "rtph264pay".to_string(),
        "config-interval=1".to_string(),
        "pt=96".to_string(),
        "!".to_string(),
        "udpsink".to_string(),
        format!("host={}", target.ip()),
        format!("port={}", target.port()),
        "sync=false".to_string(),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_caps() {
        let s = CameraSettings::default();
        let args = source_args(&s, 1920, 1080, None);
        assert_eq!(args[0], "nvarguscamerasrc");
        assert_eq!(args[1], "sensor-id=0");
        assert!(args.contains(
            &"video/x-raw(memory:NVMM),width=3280,height=2464,format=NV12,framerate=20/1".to_string()
        ));
        assert!(args.contains(&"flip-method=2".to_string()));
        assert!(args.contains(&"video/x-raw(memory:NVMM),width=1920,height=1080".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("!"));
    }

    #[test]
    fn test_still_uses_warmup_frames() {
        let s = CameraSettings {
            delay_frames: 12,
            ..CameraSettings::default()
        };
        let args = still_args(&s, 640, 480, Path::new("/tmp/scratch"));
        assert!(args.contains(&"num-buffers=12".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("location=/tmp/scratch/frame-%05d.jpg")
        );
    }

    #[test]
    fn test_video_and_stream_pipelines() {
        let s = CameraSettings::default();
        let file = video_file_args(&s, 1280, 720, Path::new("/data/clip.mp4"));
        assert!(file.contains(&"nvv4l2h264enc".to_string()));
        assert!(file.contains(&"qtmux".to_string()));
        assert!(!file.iter().any(|a| a.starts_with("num-buffers")));

        let target: SocketAddr = "192.168.1.20:5004".parse().unwrap();
        let udp = udp_args(&s, 1280, 720, target);
        assert!(udp.contains(&"host=192.168.1.20".to_string()));
        assert!(udp.contains(&"port=5004".to_string()));
        assert!(udp.contains(&"rtph264pay".to_string()));
    }

    #[test]
    fn test_keep_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        for i in 1..=3 {
            fs::write(scratch.join(format!("frame-{i:05}.jpg")), [i as u8]).unwrap();
        }
        let dest = dir.path().join("still.jpg");
        keep_last_frame(&scratch, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), vec![3]);

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        assert!(keep_last_frame(&empty, &dest).is_err());
    }

    #[test]
    fn test_missing_launcher_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = GstEngine::with_launcher("/nonexistent/gst-launch-1.0");
        let video = CaptureJob {
            kind: CaptureKind::Video {
                duration: Duration::from_secs(5),
            },
            sink: Sink::File,
            width: 1280,
            height: 720,
            output_dir: dir.path().to_path_buf(),
            udp_target: None,
        };
        let err = engine.start(video, None).unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));

        let stills = CaptureJob {
            kind: CaptureKind::Image {
                frames: 1,
                interval: Duration::ZERO,
            },
            sink: Sink::File,
            width: 640,
            height: 480,
            output_dir: dir.path().to_path_buf(),
            udp_target: None,
        };
        let err = engine.start(stills, None).unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    #[test]
    fn test_configure_remembers_missing_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let engine = GstEngine::with_launcher("/nonexistent/gst-launch-1.0");
        engine.configure(CameraSettings::default()).unwrap();
        assert!(matches!(
            *engine.launcher_check.lock().unwrap(),
            Some(Err(ref e)) if e.contains("/nonexistent/gst-launch-1.0")
        ));

        let stills = CaptureJob {
            kind: CaptureKind::Image {
                frames: 2,
                interval: Duration::ZERO,
            },
            sink: Sink::Memory,
            width: 640,
            height: 480,
            output_dir: dir.path().to_path_buf(),
            udp_target: None,
        };
        match engine.start(stills, None) {
            Err(EngineError::Unavailable(e)) => assert!(e.contains("cannot run"), "{e}"),
            other => panic!("expected unavailable, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_launcher_check_runs_lazily_once() {
        let engine = GstEngine::with_launcher("/nonexistent/gst-launch-1.0");
        assert!(engine.launcher_check.lock().unwrap().is_none());
        assert!(engine.launcher_ready().is_err());
        assert!(engine.launcher_check.lock().unwrap().is_some());
    }
}
