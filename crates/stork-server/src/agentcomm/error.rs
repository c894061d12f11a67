use thiserror::Error;

/// Failure of a call to an agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("cannot connect to agent: {0}")]
    Connect(String),

    #[error("agent call timed out after {0} seconds")]
    Timeout(u64),

    #[error("malformed agent response: {0}")]
    Protocol(String),

    /// A control agent or daemon answered with a non-success code.
    #[error("daemon returned error code {code}: {text}")]
    Daemon { code: i64, text: String },

    #[error("agent call cancelled")]
    Cancelled,
}

impl AgentError {
    /// Transport-level failures, counted against the machine.
    pub const fn is_communication(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::Protocol(_))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(0)
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}
