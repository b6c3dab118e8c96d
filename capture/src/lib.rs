//! NanoCam capture server: engine boundary, sessions, arbitration and the
//! TCP request protocol.

pub mod arbiter;
pub mod engine;
pub mod gst;
pub mod server;
pub mod session;
pub mod sim;
pub mod spool;

pub use arbiter::{Arbiter, ArbiterOptions, Disposition};
pub use engine::{CameraSettings, CaptureEngine, EngineError};
pub use gst::GstEngine;
pub use server::ServerOptions;
pub use session::{Session, SessionError, SessionStatus};
pub use sim::SimulatedEngine;
