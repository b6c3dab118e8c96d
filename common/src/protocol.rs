//! Control messages and response markers exchanged between the media client
//! and the capture server.
//!
//! Requests travel client → server as one JSON object each:
//!
//! ```text
//! {"type": "image", "width": 3280, "height": 2464, "frames": 3, "interval": 5, "format": "file"}
//! {"type": "video", "width": 1920, "height": 1080, "duration": 10, "format": "udp"}
//! {"type": "kill"}
//! {"type": "reset_timer", "duration": 30}
//! ```
//!
//! Responses start with one of the ASCII markers below.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// Server is running another session.
pub const BUSY: &[u8] = b"BUSY";
/// Pipeline started (udp) or kill serviced.
pub const OK: &[u8] = b"OK";
/// End of the manifest.
pub const DONE: &[u8] = b"DONE";
/// Separates consecutive files (marker framing).
pub const MORE: &[u8] = b"MORE";
/// End of the transfer.
pub const QUIT: &[u8] = b"QUIT";
/// The capture engine could not start; no body follows.
pub const FAIL: &[u8] = b"FAIL";
/// Sent by a client that is about to close its connection.
pub const GOODBYE: &[u8] = b"GOODBYE";

/// Upper bound on a buffered, still-incomplete control message.
pub const MAX_CONTROL_LEN: usize = 64 * 1024;

/// Where the produced media goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Frames are returned in-band, held in memory by the client.
    Opencv,
    /// Files are written on the server and transferred.
    File,
    /// Video is streamed over UDP to the client's media port.
    Udp,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opencv => "opencv",
            Self::File => "file",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Image {
        #[serde(deserialize_with = "lenient")]
        width: u32,
        #[serde(deserialize_with = "lenient")]
        height: u32,
        #[serde(deserialize_with = "lenient")]
        frames: u32,
        /// Seconds between frames.
        #[serde(deserialize_with = "lenient")]
        interval: u64,
        format: Format,
    },
    Video {
        #[serde(deserialize_with = "lenient")]
        width: u32,
        #[serde(deserialize_with = "lenient")]
        height: u32,
        /// Seconds.
        #[serde(deserialize_with = "lenient")]
        duration: u64,
        format: Format,
    },
    Kill,
    ResetTimer {
        /// Seconds from now.
        #[serde(deserialize_with = "lenient")]
        duration: u64,
    },
}

impl Request {
    /// Output format of a capture request, `None` for control signals.
    pub fn format(&self) -> Option<Format> {
        match self {
            Self::Image { format, .. } | Self::Video { format, .. } => Some(*format),
            Self::Kill | Self::ResetTimer { .. } => None,
        }
    }

    /// `Kill` and `ResetTimer` act on the active session rather than
    /// starting one.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Kill | Self::ResetTimer { .. })
    }

    /// Reject requests that parse but cannot be serviced.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Image {
                width,
                height,
                frames,
                format,
                ..
            } => {
                check_resolution(*width, *height)?;
                if *frames == 0 {
                    return Err(ProtocolError::Invalid("image request for 0 frames".into()));
                }
                if *format == Format::Udp {
                    return Err(ProtocolError::Invalid(
                        "image requests support opencv or file format only".into(),
                    ));
                }
                Ok(())
            }
            Self::Video {
                width,
                height,
                duration,
                ..
            } => {
                check_resolution(*width, *height)?;
                if *duration == 0 {
                    return Err(ProtocolError::Invalid("video request for 0 seconds".into()));
                }
                Ok(())
            }
            Self::Kill | Self::ResetTimer { .. } => Ok(()),
        }
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image {
                width,
                height,
                frames,
                interval,
                format,
            } => write!(
                f,
                "image {width}x{height} x{frames} every {interval}s [{format}]"
            ),
            Self::Video {
                width,
                height,
                duration,
                format,
            } => write!(f, "video {width}x{height} for {duration}s [{format}]"),
            Self::Kill => f.write_str("kill"),
            Self::ResetTimer { duration } => write!(f, "reset_timer {duration}s"),
        }
    }
}

fn check_resolution(width: u32, height: u32) -> Result<(), ProtocolError> {
    if width == 0 || height == 0 {
        return Err(ProtocolError::Invalid(format!(
            "invalid resolution {width}x{height}"
        )));
    }
    Ok(())
}

/// Accept numbers either as JSON numbers or as numeric strings.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + FromStr,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(u64),
        Text(String),
    }

    match Lenient::deserialize(deserializer)? {
        Lenient::Number(n) => {
            T::try_from(n).map_err(|_| D::Error::custom(format!("{n} is out of range")))
        }
        Lenient::Text(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| D::Error::custom(format!("not a number: {s:?}"))),
    }
}

// ── control-message decoding ─────────────────────────────────────────────

/// One decoded unit of client → server traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Request(Request),
    /// The client announced it is closing the connection.
    Goodbye,
    /// Skipped bytes that could not be decoded.
    Malformed(ProtocolError),
}

/// Reassembles control messages from arbitrary socket reads.
///
/// A message is complete once the buffered bytes parse as a JSON value.
/// Incomplete input stays buffered until the next [`feed`](Self::feed);
/// bytes that can never become JSON are dropped and reported once.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    buf: Vec<u8>,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of their message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete event, if any.
    pub fn next_event(&mut self) -> Option<ControlEvent> {
        let start = match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => i,
            None => {
                self.buf.clear();
                return None;
            }
        };
        self.buf.drain(..start);

        if self.buf.starts_with(GOODBYE) {
            self.buf.drain(..GOODBYE.len());
            return Some(ControlEvent::Goodbye);
        }
        if GOODBYE.starts_with(&self.buf) {
            return None;
        }

        let (parsed, used) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<serde_json::Value>();
            let parsed = stream.next();
            (parsed, stream.byte_offset())
        };

        match parsed {
            None => None,
            Some(Ok(value)) => {
                self.buf.drain(..used);
                Some(match serde_json::from_value::<Request>(value) {
                    Ok(req) => ControlEvent::Request(req),
                    Err(e) => ControlEvent::Malformed(ProtocolError::Invalid(e.to_string())),
                })
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > MAX_CONTROL_LEN {
                    let size = self.buf.len();
                    self.buf.clear();
                    Some(ControlEvent::Malformed(ProtocolError::TooLarge {
                        size,
                        max: MAX_CONTROL_LEN,
                    }))
                } else {
                    None
                }
            }
            Some(Err(e)) => {
                self.buf.clear();
                Some(ControlEvent::Malformed(ProtocolError::Malformed(e.to_string())))
            }
        }
    }
}
