//! TCP request server – one persistent connection per client.
//!
//! Each connection runs its own receive loop: bytes are fed to a
//! [`ControlDecoder`], every decoded request goes through the arbiter, and
//! its response is written before the next request is read. Responses on a
//! connection therefore follow request order.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use nanocam_common::config::Config;
use nanocam_common::framing::{Framing, TransferEncoder};
use nanocam_common::protocol::{ControlDecoder, ControlEvent, Request, BUSY, FAIL, OK};

use crate::arbiter::{Admission, Arbiter, ConnId, Disposition};
use crate::engine::Sink;
use crate::session::{SessionError, SessionOutput};
use crate::spool::FrameSpool;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub framing: Framing,
    /// Socket read size in bytes.
    pub read_chunk: usize,
    /// Staging area for in-memory frames awaiting transfer.
    pub spool_dir: PathBuf,
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            framing: config.framing,
            read_chunk: config.read_chunk.max(1),
            spool_dir: config.media_dir.join(".spool"),
        }
    }
}

/// Bind `listen_addr` and serve until `shutdown` is set.
pub async fn run(
    arbiter: Arc<Arbiter>,
    listen_addr: &str,
    options: ServerOptions,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Cannot listen on {listen_addr}"))?;
    info!(
        "Capture server listening on {listen_addr} ({} framing)",
        options.framing
    );
    serve(listener, arbiter, options, shutdown).await
}

/// Accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    arbiter: Arc<Arbiter>,
    options: ServerOptions,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = arbiter.next_conn_id();
                    info!("Connection {conn} from {peer}");
                    let connection = Connection {
                        conn,
                        peer,
                        stream,
                        arbiter: arbiter.clone(),
                        options: options.clone(),
                    };
                    tokio::spawn(connection.run());
                }
                Err(e) => warn!("Accept failed: {e}"),
            },
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }

    info!("Shutting down – stopping any active session");
    arbiter.shutdown();
    Ok(())
}

struct Connection {
    conn: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    arbiter: Arc<Arbiter>,
    options: ServerOptions,
}

impl Connection {
    async fn run(mut self) {
        let conn = self.conn;
        match self.receive_loop().await {
            Ok(()) => info!("Connection {conn} closed"),
            Err(e) => warn!("Connection {conn} dropped: {e}"),
        }
        self.arbiter.forget(conn);
    }

    async fn receive_loop(&mut self) -> io::Result<()> {
        let mut decoder = ControlDecoder::new();
        let mut buf = vec![0u8; self.options.read_chunk];

        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                debug!("Connection {}: peer closed", self.conn);
                return Ok(());
            }
            decoder.feed(&buf[..n]);

            while let Some(event) = decoder.next_event() {
                match event {
                    ControlEvent::Malformed(e) => {
                        warn!("Connection {}: {e} – ignored", self.conn);
                    }
                    ControlEvent::Goodbye => {
                        info!("Connection {}: client said goodbye", self.conn);
                        return Ok(());
                    }
                    ControlEvent::Request(request) => {
                        if let Err(e) = request.validate() {
                            warn!("Connection {}: {e} – ignored", self.conn);
                            continue;
                        }
                        self.dispatch(request).await?;
                    }
                }
            }
        }
    }

    /// Serve one request end to end, including a replay released by `Kill`.
    async fn dispatch(&mut self, request: Request) -> io::Result<()> {
        let mut next = Some(request);
        while let Some(request) = next.take() {
            debug!("Connection {}: {request}", self.conn);
            let disposition = self
                .arbiter
                .handle_request(self.conn, request, Some(self.peer.ip()))
                .await;

            match disposition {
                Ok(Disposition::Proceed(admission)) => self.deliver(admission).await?,
                Ok(Disposition::Busy) => self.stream.write_all(BUSY).await?,
                Ok(Disposition::Killed { replay }) => {
                    self.stream.write_all(OK).await?;
                    if let Some(request) = &replay {
                        info!("Connection {}: servicing pending {request}", self.conn);
                    }
                    next = replay;
                }
                Ok(Disposition::TimerReset { .. }) => {}
                Err(SessionError::EngineUnavailable(e)) => {
                    error!("Connection {}: {e}", self.conn);
                    self.stream.write_all(FAIL).await?;
                }
                Err(e) => warn!("Connection {}: {e}", self.conn),
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, admission: Admission) -> io::Result<()> {
        let Admission {
            session_id,
            sink,
            output: SessionOutput { outcome, frames },
            ..
        } = admission;

        match sink {
            Sink::Udp => {
                info!(
                    "Session {session_id} streaming to {}",
                    self.peer.ip()
                );
                self.stream.write_all(OK).await
            }
            Sink::File => {
                let artifacts = match outcome.await {
                    Ok(outcome) => outcome.artifacts,
                    Err(_) => {
                        warn!("Session {session_id} ended without an outcome");
                        Vec::new()
                    }
                };
                self.send_files(&artifacts).await
            }
            Sink::Memory => {
                let mut spool = FrameSpool::create(&self.options.spool_dir, session_id).await?;
                let spooled = spool.fill(frames).await;
                if outcome.await.is_err() {
                    warn!("Session {session_id} ended without an outcome");
                }
                let sent = match spooled {
                    Ok(()) => self.send_artifacts(spool.entries()).await,
                    Err(e) => Err(e),
                };
                spool.remove().await;
                sent
            }
        }
    }

    async fn send_files(&mut self, paths: &[PathBuf]) -> io::Result<()> {
        let named: Vec<(String, PathBuf)> = paths
            .iter()
            .map(|path| (path.display().to_string(), path.clone()))
            .collect();
        self.send_artifacts(&named).await
    }

    /// Send `(name, path)` pairs as one transfer. Unreadable files are left
    /// out of the manifest.
    async fn send_artifacts(&mut self, artifacts: &[(String, PathBuf)]) -> io::Result<()> {
        let mut files = Vec::with_capacity(artifacts.len());
        for (name, path) in artifacts {
            match tokio::fs::metadata(path).await {
                Ok(meta) => files.push((name.clone(), path.as_path(), meta.len())),
                Err(e) => warn!("Skipping {}: {e}", path.display()),
            }
        }
        let names: Vec<String> = files.iter().map(|(name, ..)| name.clone()).collect();

        let mut encoder = TransferEncoder::new(self.options.framing);
        let header = encoder.begin(&names).map_err(invalid_data)?;
        self.stream.write_all(&header).await?;

        let mut sent = header.len() as u64;
        for (_, path, len) in &files {
            let prefix = encoder.file_header(*len);
            self.stream.write_all(&prefix).await?;
            sent += prefix.len() as u64 + self.send_file(path, *len).await?;
        }
        self.stream.write_all(&encoder.finish()).await?;
        self.stream.flush().await?;

        info!(
            "Connection {}: sent {} file(s), {:.1} kB",
            self.conn,
            files.len(),
            sent as f64 / 1024.0
        );
        Ok(())
    }

    /// Stream exactly `len` bytes of `path`.
    async fn send_file(&mut self, path: &Path, len: u64) -> io::Result<u64> {
        let file = tokio::fs::File::open(path).await?;
        let copied = tokio::io::copy(&mut file.take(len), &mut self.stream).await?;
        if copied < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank to {copied} of {len} bytes", path.display()),
            ));
        }
        Ok(copied)
    }
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
