//! Shared protocol, framing and configuration for the NanoCam capture
//! server and media client.

pub mod artifact;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;

pub use error::{ProtocolError, TransferError};
pub use framing::{Framing, TransferDecoder, TransferEncoder, TransferEvent};
pub use protocol::{ControlDecoder, ControlEvent, Format, Request};
