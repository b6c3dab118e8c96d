//! Blocking media client for the NanoCam capture server.
//!
//! One [`MediaClient`] holds one persistent TCP connection. Requests are
//! strictly sequential: every call reads the complete response before it
//! returns, so responses always line up with requests.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use nanocam_common::artifact::local_path;
use nanocam_common::config::Config;
use nanocam_common::framing::{Framing, TransferDecoder, TransferEvent};
use nanocam_common::protocol::{Format, Request, GOODBYE};
use nanocam_common::ProtocolError;

use crate::receiver::{ReceiverHandle, UdpReceiver};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("server closed the connection")]
    Disconnected,

    #[error("capture engine unavailable on the server")]
    EngineUnavailable,

    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("cannot encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidRequest(#[from] ProtocolError),

    #[error("connection out of sync with the server; reconnect")]
    Desynchronized,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub framing: Framing,
    /// Downloaded files and UDP captures land here.
    pub receive_dir: PathBuf,
    pub media_port: u16,
    pub read_chunk: usize,
    pub udp_idle_timeout: Duration,
    /// `None` waits for responses indefinitely.
    pub response_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_addr: config.server_addr.clone(),
            framing: config.framing,
            receive_dir: config.receive_dir.clone(),
            media_port: config.media_port,
            read_chunk: config.read_chunk.max(1),
            udp_idle_timeout: Duration::from_secs(config.udp_idle_timeout_secs),
            response_timeout: match config.response_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Files written under the receive directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Files {
    /// Fully received files, in manifest order.
    pub paths: Vec<PathBuf>,
    /// False when the transfer was cut short; `paths` is then a prefix.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFrame {
    pub name: String,
    pub data: Vec<u8>,
}

/// Frames returned in-band for `opencv` requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frames {
    pub frames: Vec<MemoryFrame>,
    pub complete: bool,
}

/// Result of a capture request.
#[derive(Debug)]
pub enum Reply {
    Files(Files),
    Frames(Frames),
    /// The stream is running; the receiver writes it to disk.
    Streaming(ReceiverHandle),
    /// Another session holds the camera.
    Busy,
}

pub struct MediaClient {
    stream: TcpStream,
    options: ClientOptions,
    buf: Vec<u8>,
    /// Bytes read past the end of the previous response.
    carry: Vec<u8>,
    /// Last request answered with `BUSY`; the server replays it after a kill.
    pending: Option<Request>,
    /// Set once a response could not be decoded. Whatever is left of it is
    /// still in the socket, so no later response would line up.
    desynced: bool,
}

impl MediaClient {
    pub fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(&options.server_addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(options.response_timeout)?;
        info!(
            "Connected to {} ({} framing)",
            options.server_addr, options.framing
        );
        Ok(Self {
            stream,
            buf: vec![0u8; options.read_chunk],
            options,
            carry: Vec::new(),
            pending: None,
            desynced: false,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Issue a capture request and wait for its result.
    ///
    /// On `BUSY` with `override_busy` set, the active session is killed and
    /// the server's replay of this request is awaited, so the capture runs
    /// exactly once.
    pub fn request(&mut self, request: &Request, override_busy: bool) -> Result<Reply, ClientError> {
        request.validate()?;
        if request.is_control() {
            return Err(ProtocolError::Invalid(format!("{request} is not a capture request")).into());
        }

        let receiver = self.prepare(request)?;
        self.send(request)?;
        let reply = self.finish(request, receiver)?;

        if matches!(reply, Reply::Busy) && override_busy {
            info!("Camera busy – overriding");
            return match self.kill()? {
                Some(reply) => Ok(reply),
                None => Err(ClientError::Unexpected(
                    "kill released no pending request".into(),
                )),
            };
        }
        Ok(reply)
    }

    /// Ask the server to stop the active stream and wait for `OK`.
    ///
    /// If this connection's last request was answered `BUSY`, the server
    /// replays it once the camera is free; its result is returned here.
    pub fn kill(&mut self) -> Result<Option<Reply>, ClientError> {
        let pending = self.pending.take();
        let receiver = match &pending {
            Some(request) => self.prepare(request)?,
            None => None,
        };

        self.send(&Request::Kill)?;
        match self.read_response(&mut MemorySink::default())? {
            Response::Ok => debug!("Kill acknowledged"),
            other => {
                return Err(ClientError::Unexpected(format!(
                    "expected OK after kill, got {other}"
                )))
            }
        }

        match pending {
            Some(request) => self.finish(&request, receiver).map(Some),
            None => Ok(None),
        }
    }

    /// Re-arm the active session's deadline to `secs` from now. The server
    /// does not answer this message.
    pub fn reset_timer(&mut self, secs: u64) -> Result<(), ClientError> {
        self.send(&Request::ResetTimer { duration: secs })
    }

    /// Say goodbye and close the connection.
    pub fn close(mut self) -> Result<(), ClientError> {
        self.stream.write_all(GOODBYE)?;
        self.stream.flush()?;
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("Connection closed");
        Ok(())
    }

    fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        if self.desynced {
            return Err(ClientError::Desynchronized);
        }
        debug!("Sending {request}");
        self.stream.write_all(&request.to_bytes()?)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Bind the UDP port before a stream request goes out.
    fn prepare(&self, request: &Request) -> Result<Option<UdpReceiver>, ClientError> {
        if request.format() == Some(Format::Udp) {
            Ok(Some(UdpReceiver::bind(self.options.media_port)?))
        } else {
            Ok(None)
        }
    }

    /// Read the response to `request` and turn it into a [`Reply`].
    fn finish(
        &mut self,
        request: &Request,
        receiver: Option<UdpReceiver>,
    ) -> Result<Reply, ClientError> {
        let reply = match request.format() {
            Some(Format::File) => {
                let mut sink = DiskSink::new(&self.options.receive_dir)?;
                match self.read_response(&mut sink)? {
                    Response::Transfer { complete } => Reply::Files(Files {
                        paths: sink.into_paths(),
                        complete,
                    }),
                    other => self.settle(request, other)?,
                }
            }
            Some(Format::Opencv) => {
                let mut sink = MemorySink::default();
                match self.read_response(&mut sink)? {
                    Response::Transfer { complete } => Reply::Frames(Frames {
                        frames: sink.into_frames(),
                        complete,
                    }),
                    other => self.settle(request, other)?,
                }
            }
            Some(Format::Udp) => match self.read_response(&mut MemorySink::default())? {
                Response::Ok => {
                    let receiver = match receiver {
                        Some(receiver) => receiver,
                        None => UdpReceiver::bind(self.options.media_port)?,
                    };
                    let output = self
                        .options
                        .receive_dir
                        .join(format!("udp-{}.rtp", Local::now().format("%Y-%m-%d_%H%M%S")));
                    info!("Stream started – receiving into {}", output.display());
                    Reply::Streaming(receiver.start(output, self.options.udp_idle_timeout)?)
                }
                other => self.settle(request, other)?,
            },
            None => {
                return Err(ProtocolError::Invalid(format!("{request} has no result")).into());
            }
        };

        if !matches!(reply, Reply::Busy) {
            self.pending = None;
        }
        Ok(reply)
    }

    /// Responses every capture request may get.
    fn settle(&mut self, request: &Request, response: Response) -> Result<Reply, ClientError> {
        match response {
            Response::Busy => {
                info!("Camera busy – {request} recorded as pending on the server");
                self.pending = Some(request.clone());
                Ok(Reply::Busy)
            }
            Response::Fail => {
                self.pending = None;
                Err(ClientError::EngineUnavailable)
            }
            other => Err(ClientError::Unexpected(format!(
                "{other} in response to {request}"
            ))),
        }
    }

    /// Decode one response, handing artifact bytes to `sink`.
    ///
    /// A transfer that breaks after its manifest is not an error: the
    /// artifacts completed so far stay in `sink` and the response is
    /// reported incomplete. Garbage before any manifest is. Either way the
    /// connection takes no further requests.
    fn read_response<S: ArtifactSink>(&mut self, sink: &mut S) -> Result<Response, ClientError> {
        let mut decoder = TransferDecoder::new(self.options.framing);
        decoder.feed(&std::mem::take(&mut self.carry));
        let mut names: Vec<String> = Vec::new();
        let mut in_transfer = false;
        let mut received = 0u64;

        loop {
            let event = match decoder.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => {
                    match self.stream.read(&mut self.buf) {
                        Ok(0) if in_transfer => {
                            warn!("Server closed the connection mid-transfer");
                            self.desynced = true;
                            return Ok(Response::Transfer { complete: false });
                        }
                        Ok(0) => return Err(ClientError::Disconnected),
                        Ok(n) => decoder.feed(&self.buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                    continue;
                }
                Err(e) => {
                    self.desynced = true;
                    if !in_transfer {
                        return Err(ClientError::Unexpected(format!("corrupt response: {e}")));
                    }
                    warn!("Transfer corrupt: {e} – keeping {} artifact(s)", sink.completed());
                    return Ok(Response::Transfer { complete: false });
                }
            };

            match event {
                TransferEvent::Busy => return Ok(self.settle_marker(&mut decoder, Response::Busy)),
                TransferEvent::Ok => return Ok(self.settle_marker(&mut decoder, Response::Ok)),
                TransferEvent::Fail => return Ok(self.settle_marker(&mut decoder, Response::Fail)),
                TransferEvent::Manifest(manifest) => {
                    debug!("Manifest: {} artifact(s)", manifest.len());
                    names = manifest;
                    in_transfer = true;
                }
                TransferEvent::FileStart { index } => {
                    let name = names.get(index).map(String::as_str).unwrap_or_default();
                    sink.begin(index, name)?;
                }
                TransferEvent::FileData { data, .. } => {
                    received += data.len() as u64;
                    sink.write(&data)?;
                }
                TransferEvent::FileEnd { .. } => sink.end()?,
                TransferEvent::Finished => {
                    self.carry = decoder.take_remaining();
                    info!(
                        "Received {} artifact(s), {:.1} kB",
                        sink.completed(),
                        received as f64 / 1024.0
                    );
                    return Ok(Response::Transfer { complete: true });
                }
            }
        }
    }

    fn settle_marker(&mut self, decoder: &mut TransferDecoder, response: Response) -> Response {
        self.carry = decoder.take_remaining();
        response
    }
}

/// How the server answered, before artifacts are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    Busy,
    Ok,
    Fail,
    Transfer { complete: bool },
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => f.write_str("BUSY"),
            Self::Ok => f.write_str("OK"),
            Self::Fail => f.write_str("FAIL"),
            Self::Transfer { .. } => f.write_str("a transfer"),
        }
    }
}

// ── artifact sinks ───────────────────────────────────────────────────────

/// Destination of decoded artifacts.
trait ArtifactSink {
    fn begin(&mut self, index: usize, name: &str) -> io::Result<()>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn end(&mut self) -> io::Result<()>;
    /// Number of artifacts received in full.
    fn completed(&self) -> usize;
}

/// Writes artifacts as files under the receive directory. A partially
/// received file stays on disk but is not listed.
struct DiskSink {
    dir: PathBuf,
    current: Option<(PathBuf, BufWriter<File>)>,
    paths: Vec<PathBuf>,
}

impl DiskSink {
    fn new(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            current: None,
            paths: Vec::new(),
        })
    }

    fn into_paths(self) -> Vec<PathBuf> {
        self.paths
    }
}

impl ArtifactSink for DiskSink {
    fn begin(&mut self, index: usize, name: &str) -> io::Result<()> {
        let path = local_path(&self.dir, name, index);
        let file = File::create(&path)?;
        self.current = Some((path, BufWriter::new(file)));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.current {
            Some((_, out)) => out.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "data outside a file")),
        }
    }

    fn end(&mut self) -> io::Result<()> {
        if let Some((path, mut out)) = self.current.take() {
            out.flush()?;
            debug!("Saved {}", path.display());
            self.paths.push(path);
        }
        Ok(())
    }

    fn completed(&self) -> usize {
        self.paths.len()
    }
}

#[derive(Default)]
struct MemorySink {
    current: Option<MemoryFrame>,
    frames: Vec<MemoryFrame>,
}

impl MemorySink {
    fn into_frames(self) -> Vec<MemoryFrame> {
        self.frames
    }
}

impl ArtifactSink for MemorySink {
    fn begin(&mut self, _index: usize, name: &str) -> io::Result<()> {
        self.current = Some(MemoryFrame {
            name: name.to_string(),
            data: Vec::new(),
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.current {
            Some(frame) => {
                frame.data.extend_from_slice(data);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "data outside a frame")),
        }
    }

    fn end(&mut self) -> io::Result<()> {
        if let Some(frame) = self.current.take() {
            self.frames.push(frame);
        }
        Ok(())
    }

    fn completed(&self) -> usize {
        self.frames.len()
    }
}
