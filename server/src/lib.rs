//! Server side of the Unison playback sync service.
//!
//! The server owns the authoritative timeline, publishes a versioned
//! [`SyncRecord`](unison_proto::SyncRecord) over the control channel, and
//! probes the playlist so end-of-stream advances every client in lockstep.

pub mod control;
pub mod media;
pub mod registry;
pub mod server;
pub mod timeline;

pub use control::{ControlServer, TcpControlServer};
pub use media::{NullProbe, ProbeEvent, ProbePipeline, ProbeTarget};
pub use registry::{ClientSession, ControlShared, Registry, ServerEvent};
pub use server::{ServerConfig, SyncServer, DEFAULT_LATENCY};
pub use timeline::{SystemClock, Timeline};
