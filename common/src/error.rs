//! Error types shared by the capture server and the media client.

use thiserror::Error;

/// A control message that could not be turned into a [`Request`].
///
/// Never fatal to a connection: the receive loop logs it and keeps
/// listening for the next message.
///
/// [`Request`]: crate::protocol::Request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The bytes are not valid JSON.
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// Valid JSON, but not a request this server understands.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// More bytes were buffered than any control message may take.
    #[error("control message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Failure while decoding or encoding a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The manifest did not deserialize into a list of names, or a marker
    /// appeared where none was expected.
    #[error("transfer corrupt: {0}")]
    Corrupt(String),

    /// The manifest exceeds the framing limit.
    #[error("manifest too large: {size} bytes (max {max})")]
    ManifestTooLarge { size: usize, max: usize },
}

impl TransferError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        TransferError::Corrupt(msg.into())
    }
}
