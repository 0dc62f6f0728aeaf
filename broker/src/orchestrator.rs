//! Single-item synthesis: cache lookup, retries with backoff on the chosen
//! engine, one failover to the other engine, and write-through to the cache.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use engine_core::{Engine, EngineKind, SynthesisParams};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    cache::CacheStore,
    error::{BrokerError, EngineFailure, SynthesisFailure},
    metrics::BrokerMetrics,
    request::{Fingerprint, SynthesisRequest},
    state::{EngineState, Engines},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    /// Engine to try first instead of the current one
    pub engine: Option<EngineKind>,
    /// Override the configured failover switch
    pub fallback: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Synthesized,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisOutcome {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub status: OutcomeStatus,
    /// `None` when served from cache
    pub engine_used: Option<EngineKind>,
    pub fallback_used: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

pub struct Orchestrator {
    engines: Engines,
    state: Arc<EngineState>,
    cache: Arc<CacheStore>,
    metrics: BrokerMetrics,
    retry: RetryPolicy,
    fallback_enabled: bool,
    output_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        engines: Engines,
        state: Arc<EngineState>,
        cache: Arc<CacheStore>,
        metrics: BrokerMetrics,
        retry: RetryPolicy,
        fallback_enabled: bool,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            engines,
            state,
            cache,
            metrics,
            retry,
            fallback_enabled,
            output_dir,
        }
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        options: &SynthesisOptions,
    ) -> Result<SynthesisOutcome, BrokerError> {
        let start = Instant::now();
        let fingerprint = request.fingerprint();

        if let Some(path) = self.cache.lookup(&fingerprint).await {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.metrics.record_synthesis(elapsed_ms, true);
            debug!(fingerprint = %fingerprint, "cache hit");
            return Ok(SynthesisOutcome {
                fingerprint,
                path,
                status: OutcomeStatus::Cached,
                engine_used: None,
                fallback_used: false,
                attempts: 0,
                elapsed_ms,
            });
        }

        let primary_kind = match options.engine {
            Some(kind) => kind,
            None => self.state.current().await,
        };
        let params = request.params();

        let (audio, engine_used, attempts, fallback_used) =
            match self.try_engine(self.engines.get(primary_kind), request, &params).await {
                Ok((audio, attempts)) => (audio, primary_kind, attempts, false),
                Err(primary) => {
                    let (audio, engine, attempts) = self.fail_over(primary, request, &params, options).await.map_err(|e| {
                        self.metrics.record_failure();
                        e
                    })?;
                    (audio, engine, attempts, true)
                }
            };

        let path = self.store(&fingerprint, request, &audio).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.metrics.record_synthesis(elapsed_ms, false);
        info!(
            fingerprint = %fingerprint,
            engine = %engine_used,
            fallback_used,
            attempts,
            elapsed_ms,
            "Synthesized"
        );

        Ok(SynthesisOutcome {
            fingerprint,
            path,
            status: OutcomeStatus::Synthesized,
            engine_used: Some(engine_used),
            fallback_used,
            attempts,
            elapsed_ms,
        })
    }

    /// Second and last chance after the primary engine gave up.
    async fn fail_over(
        &self,
        primary: EngineFailure,
        request: &SynthesisRequest,
        params: &SynthesisParams,
        options: &SynthesisOptions,
    ) -> Result<(Vec<u8>, EngineKind, u32), BrokerError> {
        if primary.error.is_caller_error() {
            return Err(BrokerError::InvalidVoice(primary.error.to_string()));
        }

        let terminal = |fallback: Option<EngineFailure>, note: Option<String>| {
            BrokerError::Synthesis(SynthesisFailure {
                primary: primary.clone(),
                fallback,
                note,
            })
        };

        if !options.fallback.unwrap_or(self.fallback_enabled) {
            return Err(terminal(None, Some("fallback disabled".to_string())));
        }

        let fallback_kind = primary.engine.other();
        let fallback = self.engines.get(fallback_kind);
        if !fallback.is_available() {
            warn!(engine = %fallback_kind, "Fallback engine unavailable");
            return Err(terminal(None, Some(format!("fallback engine {fallback_kind} unavailable"))));
        }

        self.metrics.record_failover();
        warn!(
            from = %primary.engine,
            to = %fallback_kind,
            error = %primary.error,
            "Failing over to other engine"
        );

        match self.try_engine(fallback, request, params).await {
            Ok((audio, attempts)) => Ok((audio, fallback_kind, primary.attempts + attempts)),
            Err(failure) => Err(terminal(Some(failure), None)),
        }
    }

    /// Call one engine, retrying transient failures with backoff.
    async fn try_engine(
        &self,
        engine: &Engine,
        request: &SynthesisRequest,
        params: &SynthesisParams,
    ) -> Result<(Vec<u8>, u32), EngineFailure> {
        let kind = engine.kind();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if engine.is_available() {
                self.metrics.record_provider_call(kind);
            }
            match engine.synthesize(request.text(), request.voice(), params).await {
                Ok(audio) => return Ok((audio, attempt)),
                Err(error) if error.is_transient() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay(attempt - 1);
                    self.metrics.record_retry();
                    warn!(
                        engine = %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient synthesis failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    debug!(engine = %kind, attempt, kind = error.label(), "engine gave up");
                    return Err(EngineFailure {
                        engine: kind,
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }

    /// Write through the cache. When the cache can't take it, the audio
    /// still lands in the output directory.
    async fn store(
        &self,
        fingerprint: &Fingerprint,
        request: &SynthesisRequest,
        audio: &[u8],
    ) -> Result<PathBuf, BrokerError> {
        match self.cache.put(fingerprint, request.format(), audio).await {
            Ok(path) => Ok(path),
            Err(err) => {
                warn!(fingerprint = %fingerprint, error = %err, "Cache write failed, writing output directly");
                tokio::fs::create_dir_all(&self.output_dir).await?;
                let short = &fingerprint.as_str()[..16];
                let path = self.output_dir.join(format!(
                    "tts_{short}_{}.{}",
                    uuid::Uuid::new_v4().simple(),
                    request.format().extension()
                ));
                tokio::fs::write(&path, audio).await?;
                Ok(path)
            }
        }
    }
}
