use std::path::PathBuf;

use smss_protocol::{SessionId, Status};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot load {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: smss::Error,
    },

    #[error("session {session} failed to start: {source}")]
    Session {
        session: SessionId,
        #[source]
        source: smss::Error,
    },

    #[error(transparent)]
    Runtime(#[from] smss::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl CliError {
    /// Status reported alongside the error.
    pub fn status(&self) -> Status {
        match self {
            CliError::Config { source, .. } | CliError::Session { source, .. } => source.status(),
            CliError::Runtime(err) => err.status(),
            CliError::Io(_) | CliError::Json(_) | CliError::Anyhow(_) => Status::Unsuccessful,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_failure_keeps_runtime_status() {
        let err = CliError::Session {
            session: SessionId(1),
            source: smss::Error::SessionDeleted(SessionId(1)),
        };
        assert_eq!(err.status(), Status::DeletePending);
        assert!(err.to_string().contains("session 1"));
    }
}
