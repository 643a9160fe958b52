use thiserror::Error;

/// Errors surfaced at the session API boundary. Signal-path problems are
/// never errors; they are events or counters.
#[derive(Debug, Error)]
pub enum Error {
    /// Frequency, mode and gain changes are only legal while stopped.
    #[error("configuration can only be changed while stopped")]
    ConfigRejected,

    #[error("device io: {0}")]
    Io(#[from] std::io::Error),

    /// The rtl_tcp peer did not present a valid dongle-info header.
    #[error("not an rtl_tcp server")]
    BadDongleHeader,

    #[error("no usable tuner gains reported")]
    NoTunerGains,

    #[error("session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
