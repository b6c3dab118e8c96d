//! Local receiving pipeline for `udp` video sessions.
//!
//! The socket is bound before the request goes out so no early datagram is
//! lost. Each datagram is appended to the output file behind a big-endian
//! `u16` length, which keeps RTP packet boundaries for later depayloading.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Read timeout used to notice stop requests and idle streams.
const POLL: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub datagrams: u64,
    pub bytes: u64,
}

/// A bound, not yet running receiver.
#[derive(Debug)]
pub struct UdpReceiver {
    socket: UdpSocket,
}

impl UdpReceiver {
    /// Bind the media port on all interfaces.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(Self { socket })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Start receiving into `output` on a background thread.
    ///
    /// The thread ends on [`ReceiverHandle::stop`] or once no datagram
    /// arrived for `idle_timeout` (a zero timeout disables that check).
    pub fn start(self, output: PathBuf, idle_timeout: Duration) -> io::Result<ReceiverHandle> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&output)?;
        self.socket.set_read_timeout(Some(POLL))?;

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let finished = finished.clone();
            let output = output.clone();
            thread::Builder::new()
                .name("udp-receiver".into())
                .spawn(move || {
                    let result = receive(&self.socket, file, &stop, idle_timeout);
                    match &result {
                        Ok(stats) => info!(
                            "Received {} datagram(s), {:.1} kB into {}",
                            stats.datagrams,
                            stats.bytes as f64 / 1024.0,
                            output.display()
                        ),
                        Err(e) => warn!("UDP receiver failed: {e}"),
                    }
                    finished.store(true, Ordering::Release);
                    result
                })?
        };

        Ok(ReceiverHandle {
            stop,
            finished,
            output,
            thread: Some(thread),
        })
    }
}

fn receive(
    socket: &UdpSocket,
    file: File,
    stop: &AtomicBool,
    idle_timeout: Duration,
) -> io::Result<ReceiveStats> {
    let mut out = BufWriter::new(file);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut stats = ReceiveStats::default();
    let mut last_packet = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if stats.datagrams == 0 {
                    debug!("First datagram from {from}");
                }
                out.write_all(&(n as u16).to_be_bytes())?;
                out.write_all(&buf[..n])?;
                stats.datagrams += 1;
                stats.bytes += n as u64;
                last_packet = Instant::now();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if !idle_timeout.is_zero() && last_packet.elapsed() >= idle_timeout {
                    debug!("No datagram for {}s – stream ended", idle_timeout.as_secs());
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    out.flush()?;
    Ok(stats)
}

/// Handle to a running receiver. Dropping it leaves the thread running
/// until the stream goes idle.
#[derive(Debug)]
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    output: PathBuf,
    thread: Option<JoinHandle<io::Result<ReceiveStats>>>,
}

impl ReceiverHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Flag that stops the receiver when set, e.g. from a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Wait for the receiver thread and return what it received.
    pub fn join(mut self) -> io::Result<ReceiveStats> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| io::Error::other("udp receiver thread panicked"))?,
            None => Ok(ReceiveStats::default()),
        }
    }
}
