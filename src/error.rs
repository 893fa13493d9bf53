use std::io;

/// Errors produced by the daemon and the per-request I/O engine.
///
/// Configuration and bind failures are fatal to startup and surfaced from
/// [`crate::server::daemon::Daemon::start`]. Per-request errors are recovered
/// locally: the engine attaches a default error response and hands the error
/// back to the blocked reader or writer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid daemon configuration. Carries every violated constraint, not
    /// just the first one found.
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    /// The listening endpoint could not be acquired.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The callback runtime could not be started.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),

    /// The request body exceeded the cap passed to `open_for_read`.
    #[error("request body is too big (max = {max} bytes)")]
    PayloadTooLarge { max: usize },

    /// No mutually acceptable content encoding.
    #[error("no acceptable content encoding")]
    NotAcceptable,

    /// The client disconnected or idle-timed out while I/O was pending.
    #[error("connection aborted")]
    ConnectionAborted,

    /// WebSocket handshake or raw-socket failure.
    #[error("websocket failure: {0}")]
    Upgrade(String),
}

impl Error {
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::ConnectionAborted => io::ErrorKind::ConnectionAborted,
            Error::PayloadTooLarge { .. } => io::ErrorKind::InvalidData,
            Error::NotAcceptable => io::ErrorKind::InvalidData,
            Error::Upgrade(_) => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    /// The blocking adapters implement `std::io::Read`/`Write`, so engine
    /// errors cross that boundary as `io::Error` with a matching kind.
    fn from(err: Error) -> io::Error {
        io::Error::new(err.io_kind(), err)
    }
}
