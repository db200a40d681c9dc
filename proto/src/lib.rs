//! Wire model shared by the Unison server and client.
//!
//! Everything that crosses the control channel lives here: the
//! [`SyncRecord`] the server publishes, the [`ClientDescriptor`] a client
//! sends when joining, and the framing that carries both as self-delimited
//! JSON objects over a byte stream.

mod error;
mod frame;
mod record;

pub use error::{Error, Result};
pub use frame::{write_frame, FrameReader, MAX_FRAME_LEN};
pub use record::{
    ClientDescriptor, Crop, Offset, Playlist, Rotate, Scale, SyncRecord, Track, TransformSet,
    DURATION_UNKNOWN, TRACK_PAST_END,
};

/// One millisecond in nanoseconds.
pub const MSECOND: u64 = 1_000_000;
/// One second in nanoseconds.
pub const SECOND: u64 = 1_000_000_000;

/// A monotonic nanosecond time source.
///
/// On the server this is the authoritative reference clock; on the client it
/// is the local clock after being disciplined to the server's over the
/// network. Both sides of the timeline arithmetic only ever need `now()`.
pub trait ReferenceClock: Send + Sync + 'static {
    /// Current reference time in nanoseconds.
    fn now(&self) -> u64;
}
