use thiserror::Error;

/// The error taxonomy surfaced at the public API boundary.
///
/// Internal task wiring keeps using `anyhow::Result` (see `watched_tasks`);
/// this enum is what callers of the socket/connection API match on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("ok")]
    Ok,
    #[error("internal fault")]
    Fault,
    #[error("invalid argument")]
    Arg,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid state for requested operation")]
    BadState,
    #[error("closed")]
    Closed,
    #[error("aborted")]
    Aborted,
    #[error("refused")]
    Refused,
    #[error("communication error")]
    Comm,
    #[error("write error")]
    Writing,
    #[error("read error")]
    Reading,
    #[error("timed out")]
    Timeout,
    #[error("connecting")]
    Connecting,
    #[error("invalid format")]
    InvalidFormat,
    #[error("not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("not implemented")]
    NotImpl,
    #[error("disk I/O error")]
    DiskIo,
    #[error("fatal error")]
    Fatal,
    #[error("retry")]
    Retry,
    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Whether retrying the operation that produced this error might
    /// eventually succeed without external intervention.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Comm
                | ErrorKind::Timeout
                | ErrorKind::Connecting
                | ErrorKind::Retry
                | ErrorKind::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, ErrorKind>;
