use thiserror::Error;

/// Error taxonomy for the sync service.
///
/// Propagation rules: `Config` aborts startup; `Transport` on a single
/// session closes that session only; `Decode` on the client closes the
/// session and surfaces; `Timeline` forces the affected pipeline to null and
/// the next record retries; `Clock` blocks playback until the next record.
/// There is no internal retry cadence beyond incoming records.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unusable configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Accept, read or write failure on the control channel.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed JSON or a frame missing required fields.
    #[error("decode error: {0}")]
    Decode(String),

    /// A pipeline state transition failed.
    #[error("timeline error: {0}")]
    Timeline(String),

    /// Clock synchronisation did not complete within its bound.
    #[error("clock error: {0}")]
    Clock(String),

    /// Schema violation or unexpected traffic on the control channel.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
