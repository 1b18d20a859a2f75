use std::time::Duration;

use crate::models::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Api,
    JobFailed,
    /// A completed job's artifact does not match the expected schema.
    MalformedArtifact,
    InvalidScenario,
    PollTimeout,
    InvalidTransition,
    NotFound,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeoutReason {
    ConsecutiveFailures(u32),
    Elapsed(Duration),
}

impl std::fmt::Display for PollTimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsecutiveFailures(count) => write!(f, "{count} consecutive fetch failures"),
            Self::Elapsed(elapsed) => write!(f, "{}s without a terminal status", elapsed.as_secs()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A single status fetch exceeded its own timeout.
    #[error("status fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("investigation {investigation_id} failed: {message}")]
    JobFailed {
        investigation_id: String,
        message: String,
    },

    #[error("malformed artifact: {0}")]
    MalformedArtifact(String),

    #[error("invalid what-if scenario: {0}")]
    InvalidScenario(String),

    #[error("stopped polling {investigation_id}: {reason}")]
    PollTimeout {
        investigation_id: String,
        reason: PollTimeoutReason,
    },

    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] StateError),

    #[error("investigation {investigation_id} is {status}, results are not available yet")]
    NotComplete {
        investigation_id: String,
        status: RunStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A success response whose body could not be decoded.
    #[error("malformed response body: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("poll task ended abnormally: {0}")]
    PollTask(String),
}

impl TrackerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::FetchTimeout(_) => ErrorKind::Transport,
            Self::Api { status: 404, .. } | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Api { .. } | Self::NotComplete { .. } | Self::MalformedResponse(_) => ErrorKind::Api,
            Self::JobFailed { .. } => ErrorKind::JobFailed,
            Self::MalformedArtifact(_) => ErrorKind::MalformedArtifact,
            Self::InvalidScenario(_) => ErrorKind::InvalidScenario,
            Self::PollTimeout { .. } | Self::PollTask(_) => ErrorKind::PollTimeout,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Config(_) | Self::InvalidInput(_) | Self::Io(_) | Self::Csv(_) | Self::Json(_) => {
                ErrorKind::Input
            }
        }
    }

    /// Whether the poller should retry on the next tick instead of failing.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::FetchTimeout(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("illegal transition for {subject}: {from} -> {to}")]
    IllegalTransition {
        subject: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("an investigation needs at least one agent")]
    NoAgents,

    #[error("agent {0} must be running to record a task")]
    AgentNotRunning(String),

    #[error("final report can only be attached to a complete investigation (status is {0})")]
    ReportBeforeCompletion(RunStatus),

    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let busy = TrackerError::Api {
            status: 503,
            message: "busy".to_string(),
        };
        let limited = TrackerError::Api {
            status: 429,
            message: String::new(),
        };
        let missing = TrackerError::Api {
            status: 404,
            message: "Analysis not found".to_string(),
        };

        assert!(busy.is_transient());
        assert!(limited.is_transient());
        assert!(!missing.is_transient());
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(TrackerError::FetchTimeout(Duration::from_secs(10)).is_transient());
    }

    #[test]
    fn job_failure_is_terminal() {
        let err = TrackerError::JobFailed {
            investigation_id: "inv-1".to_string(),
            message: "agent crashed".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::JobFailed);
        assert_eq!(err.to_string(), "investigation inv-1 failed: agent crashed");
    }

    #[test]
    fn poll_timeout_reason_renders() {
        let err = TrackerError::PollTimeout {
            investigation_id: "inv-2".to_string(),
            reason: PollTimeoutReason::ConsecutiveFailures(8),
        };
        assert_eq!(err.kind(), ErrorKind::PollTimeout);
        assert!(err.to_string().contains("8 consecutive fetch failures"));
    }

    #[test]
    fn undecodable_response_is_an_api_error_not_a_bad_artifact() {
        let decode = serde_json::from_str::<serde_json::Value>("{\"status\": ").unwrap_err();
        let err = TrackerError::MalformedResponse(decode);
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("malformed response body"));
    }
}
