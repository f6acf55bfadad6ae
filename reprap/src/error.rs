use std::time::Duration;

/// Error hierarchy surfaced by public engine methods.
///
/// Mirrors the source protocol's ad hoc exception classes
/// (`TimeoutTransportException`, `EofTransportException`, the
/// `SendCommandError` variants the send queue used to reject callers with)
/// collapsed into one `thiserror` enum the way a Rust crate in this corpus
/// would.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("transport read timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport reached end of stream")]
    Eof,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("firmware requested resend of line {requested}, but only lines >= {oldest_known} are retained")]
    UnknownResend { requested: u64, oldest_known: u64 },

    #[error("firmware reported a fatal error: {message}")]
    FatalFirmwareError { message: String },

    #[error("not connected to a printer")]
    NotConnected,

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("command deadline exceeded")]
    DeadlineExceeded,

    #[error("command queue already contains a pending entry of type {0:?}")]
    TypeAlreadyInQueue(String),

    #[error("command was abandoned before it could be sent")]
    AbruptCancellation,
}

pub type Result<T> = std::result::Result<T, EngineError>;
