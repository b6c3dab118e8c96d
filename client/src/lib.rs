//! NanoCam media client: requests captures over one persistent connection
//! and reconstructs the transferred files, frames or UDP stream locally.

pub mod client;
pub mod receiver;

pub use client::{ClientError, ClientOptions, Files, Frames, MediaClient, MemoryFrame, Reply};
pub use receiver::{ReceiveStats, ReceiverHandle, UdpReceiver};
