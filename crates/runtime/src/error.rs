//! Error types for the session manager runtime.

use smss_protocol::{FrameError, SessionId, Status};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading subsystems or sequencing a session.
#[derive(Debug, Error)]
pub enum Error {
    /// Image is unreachable, or no subsystem is available to host it.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry slot allocation failed.
    #[error("Out of memory: subsystem registry is full")]
    OutOfMemory,

    /// RPC channel broken or peer gone.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A peer subsystem answered with a failure status.
    #[error("Peer subsystem rejected the request: {0}")]
    PeerRejected(Status),

    /// The target session vanished while we waited on it.
    #[error("Session {0} was deleted")]
    SessionDeleted(SessionId),

    /// Bounded wait expired with the session still present.
    #[error("Timeout after {waited_ms}ms waiting for subsystem in session {session}")]
    Timeout { session: SessionId, waited_ms: u64 },

    /// The new process's initial thread could not be resumed.
    #[error("Failed to resume thread: {0}")]
    ResumeFailed(String),

    /// Malformed or mismatched frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The process primitive refused a request.
    #[error("Process error: {status}: {message}")]
    Process { status: Status, message: String },

    /// A privilege or session-space operation failed.
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// A second live server announced itself for the same session and kind.
    #[error("Subsystem already connected: {0}")]
    AlreadyConnected(String),

    /// The operation was abandoned before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl Error {
    /// The single status value reported to the top-level caller.
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound(_) => Status::ObjectNameNotFound,
            Error::OutOfMemory => Status::NoMemory,
            Error::TransportFailure(_) => Status::PortDisconnected,
            Error::PeerRejected(status) => *status,
            Error::SessionDeleted(_) => Status::DeletePending,
            Error::Timeout { .. } => Status::Timeout,
            Error::ResumeFailed(_) => Status::ResumeFailed,
            Error::Protocol(_) | Error::Json(_) => Status::InvalidParameter,
            Error::Process { status, .. } => *status,
            Error::Privilege(_) => Status::AccessDenied,
            Error::AlreadyConnected(_) => Status::ObjectNameCollision,
            Error::Cancelled => Status::Cancelled,
            Error::Config(_) | Error::Io(_) => Status::Unsuccessful,
        }
    }

    /// Returns true if this is the bounded-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true if the target session disappeared mid-operation.
    pub fn is_session_deleted(&self) -> bool {
        matches!(self, Error::SessionDeleted(_))
    }
}
