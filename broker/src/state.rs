use std::sync::Arc;

use engine_core::{AzureEngine, EdgeEngine, Engine, EngineKind, SpeechTransport};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::BrokerError;

/// Both configured engines, addressable by kind
#[derive(Debug, Clone)]
pub struct Engines {
    azure: Engine,
    edge: Engine,
}

impl Engines {
    pub fn new(azure: AzureEngine, edge: EdgeEngine) -> Self {
        Self {
            azure: Engine::Azure(azure),
            edge: Engine::Edge(edge),
        }
    }

    pub fn from_transports(
        credentials: Option<engine_core::AzureCredentials>,
        azure_transport: Arc<dyn SpeechTransport>,
        edge_transport: Arc<dyn SpeechTransport>,
    ) -> Self {
        Self::new(
            AzureEngine::new(credentials, azure_transport),
            EdgeEngine::new(edge_transport),
        )
    }

    pub fn get(&self, kind: EngineKind) -> &Engine {
        match kind {
            EngineKind::Azure => &self.azure,
            EngineKind::Edge => &self.edge,
        }
    }

    pub fn available(&self) -> Vec<EngineKind> {
        [EngineKind::Azure, EngineKind::Edge]
            .into_iter()
            .filter(|kind| self.get(*kind).is_available())
            .collect()
    }
}

/// Process-wide current engine. Read by every request, written only by
/// `switch_engine`.
#[derive(Debug)]
pub struct EngineState {
    current: RwLock<EngineKind>,
}

impl EngineState {
    /// Start on `preferred`, or on the other engine if `preferred` can't run.
    pub fn resolve(preferred: EngineKind, engines: &Engines) -> Self {
        let kind = if engines.get(preferred).is_available() {
            preferred
        } else {
            let other = preferred.other();
            warn!(
                preferred = %preferred,
                using = %other,
                "Configured engine unavailable at startup, using fallback"
            );
            other
        };
        info!(engine = %kind, "Engine state initialized");
        Self {
            current: RwLock::new(kind),
        }
    }

    pub async fn current(&self) -> EngineKind {
        *self.current.read().await
    }

    /// Switch the current engine. Returns the previous one.
    pub async fn switch_engine(&self, kind: EngineKind, engines: &Engines) -> Result<EngineKind, BrokerError> {
        if !engines.get(kind).is_available() {
            return Err(BrokerError::EngineUnavailable(format!(
                "{kind} engine is not configured"
            )));
        }
        let mut current = self.current.write().await;
        let previous = std::mem::replace(&mut *current, kind);
        if previous != kind {
            info!(from = %previous, to = %kind, "Switched engine");
        }
        Ok(previous)
    }
}
