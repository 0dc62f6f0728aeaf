use thiserror::Error;

/// Failure of a single provider call, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid voice: {0}")]
    InvalidVoice(String),
}

impl EngineError {
    /// Only network trouble is worth retrying on the same provider
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Network(_))
    }

    /// Caller input problem: neither retried nor failed over
    pub fn is_caller_error(&self) -> bool {
        matches!(self, EngineError::InvalidVoice(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Auth(_) => "auth",
            EngineError::Quota(_) => "quota",
            EngineError::Network(_) => "network",
            EngineError::InvalidVoice(_) => "invalid_voice",
        }
    }

    /// Classify an HTTP-style status returned by a provider endpoint.
    pub fn from_status(status: u16, body: &str) -> Self {
        let lower = body.to_ascii_lowercase();
        let msg = if body.trim().is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {}", body.trim())
        };

        match status {
            401 | 403 if lower.contains("quota") => EngineError::Quota(msg),
            401 | 403 => EngineError::Auth(msg),
            429 => EngineError::Quota(msg),
            400 | 404 if lower.contains("voice") => EngineError::InvalidVoice(msg),
            _ if lower.contains("quota") => EngineError::Quota(msg),
            _ => EngineError::Network(msg),
        }
    }
}
