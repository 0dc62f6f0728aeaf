use std::{fmt, path::PathBuf};

use engine_core::{EngineError, EngineKind};
use thiserror::Error;

/// Cache storage failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io { path: path.into(), source }
    }
}

/// Last error one engine produced before the orchestrator gave up on it
#[derive(Debug, Clone)]
pub struct EngineFailure {
    pub engine: EngineKind,
    pub attempts: u32,
    pub error: EngineError,
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} attempt(s): {}", self.engine, self.attempts, self.error)
    }
}

/// Terminal synthesis failure across both engines
#[derive(Debug, Clone)]
pub struct SynthesisFailure {
    pub primary: EngineFailure,
    pub fallback: Option<EngineFailure>,
    pub note: Option<String>,
}

impl fmt::Display for SynthesisFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if let Some(fallback) = &self.fallback {
            write!(f, "; fallback {fallback}")?;
        }
        if let Some(note) = &self.note {
            write!(f, " ({note})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid input: {0}")]
    InvalidRequest(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(SynthesisFailure),

    #[error("Invalid voice: {0}")]
    InvalidVoice(String),

    #[error("Batch incomplete: {} item(s) failed", .failed.len())]
    IncompleteBatch { failed: Vec<usize> },

    #[error("No item in the batch could be synthesized ({total} item(s))")]
    NoSuccessfulItems { total: usize },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// HTTP status an outer API layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::InvalidRequest(_) | BrokerError::InvalidVoice(_) => 400,
            BrokerError::IncompleteBatch { .. } => 422,
            BrokerError::EngineUnavailable(_) => 503,
            BrokerError::Synthesis(_) | BrokerError::NoSuccessfulItems { .. } => 502,
            BrokerError::Cache(_) | BrokerError::Io(_) => {
                tracing::error!("Internal error: {}", self);
                500
            }
        }
    }
}
