//! TTS request broker: one surface over the Azure and Edge speech engines
//! with a content-addressed cache, engine failover and batch synthesis.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod request;
pub mod state;
pub mod timecodes;
pub mod validation;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use audio_core::AudioMerger;
use engine_core::{fallback_voices, group_by_language, EngineKind, SpeechTransport, VoiceDescriptor};
use serde::Serialize;
use tracing::{info, warn};

pub use batch::{
    BatchItem, BatchItemResult, BatchOutcome, BatchRequest, BatchStats, ItemStatus, MergedAudio,
    ProcessingMode, TimecodeOutcome,
};
pub use cache::{CacheBudget, CacheEntry, CacheLease, CacheStats, CacheStore};
pub use config::{BrokerConfig, FailurePolicy, MergeTool};
pub use error::{BrokerError, CacheError, EngineFailure, SynthesisFailure};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use orchestrator::{OutcomeStatus, RetryPolicy, SynthesisOptions, SynthesisOutcome};
pub use request::{Fingerprint, SynthesisRequest, SynthesisRequestBuilder};
pub use timecodes::Timecode;

use batch::BatchCoordinator;
use orchestrator::Orchestrator;
use state::{EngineState, Engines};

/// Install the fmt subscriber with `RUST_LOG` filtering (default `info`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub current: EngineKind,
    pub available: Vec<EngineKind>,
    pub fallback_enabled: bool,
    pub azure_region: Option<String>,
    pub merge_tool: Option<PathBuf>,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceListing {
    /// Engine that produced the list, `None` for the built-in fallback list
    pub engine: Option<EngineKind>,
    pub total: usize,
    pub voices: BTreeMap<String, Vec<VoiceDescriptor>>,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    cache: Arc<CacheStore>,
    state: Arc<EngineState>,
    orchestrator: Arc<Orchestrator>,
    batch: BatchCoordinator,
    metrics: BrokerMetrics,
}

impl Broker {
    pub async fn new(
        config: BrokerConfig,
        azure_transport: Arc<dyn SpeechTransport>,
        edge_transport: Arc<dyn SpeechTransport>,
    ) -> Result<Self, BrokerError> {
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let budget = CacheBudget {
            max_bytes: config.cache_max_bytes,
            max_entries: config.cache_max_entries,
        };
        let cache = Arc::new(CacheStore::open(&config.cache_dir, budget).await?);

        let engines = Engines::from_transports(config.azure_credentials(), azure_transport, edge_transport);
        let state = Arc::new(EngineState::resolve(config.engine, &engines));

        let merger = match &config.merge_tool {
            MergeTool::Detect => AudioMerger::detect(),
            MergeTool::Path(path) => AudioMerger::with_tool(path.clone()),
            MergeTool::Disabled => AudioMerger::in_process(),
        };

        let metrics = BrokerMetrics::new();
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base(),
            max_delay: config.retry_max(),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            engines,
            Arc::clone(&state),
            Arc::clone(&cache),
            metrics.clone(),
            retry,
            config.fallback_enabled,
            config.output_dir.clone(),
        ));

        let config = Arc::new(config);
        let batch = BatchCoordinator::new(
            Arc::clone(&orchestrator),
            Arc::clone(&cache),
            merger,
            Arc::clone(&config),
            metrics.clone(),
        );

        info!(
            engine = %state.current().await,
            cache_dir = %config.cache_dir.display(),
            output_dir = %config.output_dir.display(),
            max_concurrency = config.max_concurrency,
            "Broker ready"
        );

        Ok(Self {
            config,
            cache,
            state,
            orchestrator,
            batch,
            metrics,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Synthesize one request. The returned path is the cache-canonical file.
    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        options: &SynthesisOptions,
    ) -> Result<SynthesisOutcome, BrokerError> {
        self.orchestrator.synthesize(request, options).await
    }

    /// Synthesize one request and copy the audio to `output_name` in the
    /// output directory.
    pub async fn synthesize_as(
        &self,
        request: &SynthesisRequest,
        options: &SynthesisOptions,
        output_name: &str,
    ) -> Result<SynthesisOutcome, BrokerError> {
        let file_name = validation::output_file_name(Some(output_name), "tts", request.format())?;
        let mut outcome = self.orchestrator.synthesize(request, options).await?;
        let dest = self.config.output_dir.join(file_name);
        tokio::fs::copy(&outcome.path, &dest).await?;
        outcome.path = dest;
        Ok(outcome)
    }

    pub async fn synthesize_batch(&self, request: BatchRequest) -> Result<BatchOutcome, BrokerError> {
        self.batch.synthesize_batch(request).await
    }

    pub async fn synthesize_batch_with_timecodes(
        &self,
        request: BatchRequest,
    ) -> Result<TimecodeOutcome, BrokerError> {
        self.batch.synthesize_with_timecodes(request).await
    }

    /// Voices of the current engine, else the other engine, else the
    /// built-in list, grouped by language.
    pub async fn list_voices(&self) -> VoiceListing {
        let current = self.state.current().await;
        for kind in [current, current.other()] {
            let engine = self.orchestrator.engines().get(kind);
            if !engine.is_available() {
                continue;
            }
            match engine.list_voices().await {
                Ok(voices) if !voices.is_empty() => {
                    return VoiceListing {
                        engine: Some(kind),
                        total: voices.len(),
                        voices: group_by_language(voices),
                    };
                }
                Ok(_) => warn!(engine = %kind, "Engine returned no voices"),
                Err(e) => warn!(engine = %kind, error = %e, "Listing voices failed"),
            }
        }

        let voices = fallback_voices();
        VoiceListing {
            engine: None,
            total: voices.len(),
            voices: group_by_language(voices),
        }
    }

    pub async fn engine_info(&self) -> EngineInfo {
        let engines = self.orchestrator.engines();
        EngineInfo {
            current: self.state.current().await,
            available: engines.available(),
            fallback_enabled: self.config.fallback_enabled,
            azure_region: self.config.azure_credentials().map(|c| c.region),
            merge_tool: self.batch.merger().tool().map(|p| p.to_path_buf()),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Change the process-wide engine. Returns the previous one.
    pub async fn switch_engine(&self, kind: EngineKind) -> Result<EngineKind, BrokerError> {
        self.state.switch_engine(kind, self.orchestrator.engines()).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) -> usize {
        self.cache.clear().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
