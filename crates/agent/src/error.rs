use fleet_core::{LeaseId, LeaseTransitionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lease {0} was already started")]
    AlreadyStarted(LeaseId),

    #[error(transparent)]
    Transition(#[from] LeaseTransitionError),

    #[error("Giving up after {attempts} failed update attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the update loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(AgentError::Transport("connection reset".into()).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(AgentError::Io(io).is_retryable());
    }

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(!AgentError::Protocol("bad frame".into()).is_retryable());
        assert!(!AgentError::AlreadyStarted("lease-1".into()).is_retryable());
        let exhausted = AgentError::RetriesExhausted {
            attempts: 3,
            source: Box::new(AgentError::Transport("down".into())),
        };
        assert!(!exhausted.is_retryable());
    }
}
