//! Batch synthesis: per-item validation, fingerprint dedup, bounded
//! concurrent dispatch, failure policy and the final merge.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use audio_core::{AudioFormat, AudioMerger, MergeError, MergeStrategy};
use engine_core::EngineKind;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheLease, CacheStore},
    config::{clamp_concurrency, BrokerConfig, FailurePolicy},
    error::BrokerError,
    metrics::BrokerMetrics,
    orchestrator::{Orchestrator, OutcomeStatus, SynthesisOptions, SynthesisOutcome},
    request::{Fingerprint, SynthesisRequest},
    timecodes::{self, TimedSegment, Timecode},
    validation,
};

const CANCELLED: &str = "cancelled";

/// One input line. Unset fields fall back to the batch defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub rate: Option<String>,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub pitch: Option<String>,
}

impl BatchItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub rate: Option<String>,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub pitch: Option<String>,
    #[serde(default)]
    pub format: Option<AudioFormat>,
    /// `Some(0)` forces serial processing
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub silence_ms: Option<u64>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub engine: Option<EngineKind>,
    #[serde(default)]
    pub fallback: Option<bool>,
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl BatchRequest {
    pub fn new(items: Vec<BatchItem>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(BatchItem::new).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Cached,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub status: ItemStatus,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub engine_used: Option<EngineKind>,
    pub duration_ms: u64,
    /// Index of the earlier item with the same fingerprint. A duplicate makes
    /// no call of its own and repeats that item's status, path and engine.
    pub duplicate_of: Option<usize>,
}

impl BatchItemResult {
    fn failed(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            status: ItemStatus::Failed,
            file_path: None,
            error: Some(error.into()),
            engine_used: None,
            duration_ms: 0,
            duplicate_of: None,
        }
    }

    fn from_outcome(index: usize, outcome: &Result<SynthesisOutcome, String>) -> Self {
        match outcome {
            Ok(outcome) => Self {
                index,
                status: match outcome.status {
                    OutcomeStatus::Synthesized => ItemStatus::Success,
                    OutcomeStatus::Cached => ItemStatus::Cached,
                },
                file_path: Some(outcome.path.clone()),
                error: None,
                engine_used: outcome.engine_used,
                duration_ms: outcome.elapsed_ms,
                duplicate_of: None,
            },
            Err(error) => Self::failed(index, error.clone()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status != ItemStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Serial,
    Concurrent,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub total_items: usize,
    pub distinct_fingerprints: usize,
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    pub dropped_at_merge: usize,
    pub processing_mode: ProcessingMode,
    pub concurrency: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedAudio {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub segments_merged: usize,
    /// Item indices whose audio could not be merged
    pub dropped_segments: Vec<usize>,
    pub duration_ms: Option<u64>,
    pub strategy: MergeStrategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub results: Vec<BatchItemResult>,
    pub stats: BatchStats,
    /// `None` when the merge step failed, see `merge_error`
    pub merged: Option<MergedAudio>,
    pub merge_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimecodeOutcome {
    pub results: Vec<BatchItemResult>,
    pub stats: BatchStats,
    pub timecodes: Vec<Timecode>,
    pub total_duration_ms: u64,
}

enum Slot {
    Invalid(String),
    /// Position in the distinct list
    Primary(usize),
    /// Item index of the first occurrence
    Duplicate(usize),
}

/// Items after synthesis, before merging or timing. Holds the batch's cache
/// lease so its segments outlive any eviction until the run is dropped.
struct ItemsRun {
    results: Vec<BatchItemResult>,
    requests: Vec<Option<SynthesisRequest>>,
    distinct: usize,
    mode: ProcessingMode,
    concurrency: usize,
    started: Instant,
    _lease: CacheLease,
}

impl ItemsRun {
    fn stats(&self, dropped_at_merge: usize) -> BatchStats {
        let count = |status: ItemStatus| self.results.iter().filter(|r| r.status == status).count();
        BatchStats {
            total_items: self.results.len(),
            distinct_fingerprints: self.distinct,
            succeeded: count(ItemStatus::Success),
            cached: count(ItemStatus::Cached),
            failed: count(ItemStatus::Failed),
            dropped_at_merge,
            processing_mode: self.mode,
            concurrency: self.concurrency,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn apply_policy(&self, policy: FailurePolicy) -> Result<(), BrokerError> {
        let failed: Vec<usize> = self
            .results
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.index)
            .collect();
        if failed.len() == self.results.len() {
            return Err(BrokerError::NoSuccessfulItems {
                total: self.results.len(),
            });
        }
        if policy == FailurePolicy::Strict && !failed.is_empty() {
            return Err(BrokerError::IncompleteBatch { failed });
        }
        Ok(())
    }
}

pub struct BatchCoordinator {
    orchestrator: Arc<Orchestrator>,
    cache: Arc<CacheStore>,
    merger: AudioMerger,
    config: Arc<BrokerConfig>,
    metrics: BrokerMetrics,
}

impl BatchCoordinator {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        cache: Arc<CacheStore>,
        merger: AudioMerger,
        config: Arc<BrokerConfig>,
        metrics: BrokerMetrics,
    ) -> Self {
        Self {
            orchestrator,
            cache,
            merger,
            config,
            metrics,
        }
    }

    fn silence(&self, batch: &BatchRequest) -> Duration {
        batch
            .silence_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.silence())
    }

    pub fn merger(&self) -> &AudioMerger {
        &self.merger
    }

    /// Synthesize every item and merge the results into one file. A failed
    /// merge leaves `merged` empty; the item results are still returned.
    pub async fn synthesize_batch(&self, request: BatchRequest) -> Result<BatchOutcome, BrokerError> {
        let format = request.format.unwrap_or(self.config.default_format);
        let file_name = validation::output_file_name(request.output_name.as_deref(), "batch", format)?;
        let policy = request.failure_policy.unwrap_or(self.config.failure_policy);

        let run = self.run_items(&request).await?;
        run.apply_policy(policy)?;

        // Duplicates are merged again at their own position
        let segments: Vec<(usize, PathBuf)> = run
            .results
            .iter()
            .filter_map(|r| r.file_path.clone().map(|p| (r.index, p)))
            .collect();
        let paths: Vec<PathBuf> = segments.iter().map(|(_, p)| p.clone()).collect();
        let output = self.config.output_dir.join(&file_name);

        let (merged, merge_error, dropped_at_merge) =
            match self.merger.merge(&paths, &output, format, self.silence(&request)).await {
                Ok(report) => {
                    let dropped_segments: Vec<usize> = report
                        .dropped
                        .iter()
                        .filter_map(|&pos| segments.get(pos).map(|(index, _)| *index))
                        .collect();
                    if policy == FailurePolicy::Strict && !dropped_segments.is_empty() {
                        return Err(BrokerError::IncompleteBatch {
                            failed: dropped_segments,
                        });
                    }
                    let dropped = dropped_segments.len();
                    let merged = MergedAudio {
                        path: report.output,
                        format,
                        segments_merged: report.segments_merged,
                        dropped_segments,
                        duration_ms: report.duration.map(|d| d.as_millis() as u64),
                        strategy: report.strategy,
                    };
                    (Some(merged), None, dropped)
                }
                Err(e) => {
                    error!(output = %output.display(), error = %e, "Batch merge failed, returning item results only");
                    let dropped = match &e {
                        MergeError::NoSegments { .. } => segments.len(),
                        _ => 0,
                    };
                    (None, Some(e.to_string()), dropped)
                }
            };

        let stats = run.stats(dropped_at_merge);
        info!(
            total = stats.total_items,
            distinct = stats.distinct_fingerprints,
            succeeded = stats.succeeded,
            cached = stats.cached,
            failed = stats.failed,
            dropped = stats.dropped_at_merge,
            mode = ?stats.processing_mode,
            elapsed_ms = stats.elapsed_ms,
            merged = merged.is_some(),
            "Batch finished"
        );

        Ok(BatchOutcome {
            results: run.results,
            stats,
            merged,
            merge_error,
        })
    }

    /// Synthesize every item without merging and report where each would
    /// sit on a merged timeline.
    pub async fn synthesize_with_timecodes(&self, request: BatchRequest) -> Result<TimecodeOutcome, BrokerError> {
        let policy = request.failure_policy.unwrap_or(self.config.failure_policy);
        let run = self.run_items(&request).await?;
        run.apply_policy(policy)?;

        let mut segments = Vec::new();
        let mut unreadable = Vec::new();
        for result in &run.results {
            let (Some(path), Some(Some(item))) = (&result.file_path, run.requests.get(result.index)) else {
                continue;
            };
            let probe_path = path.clone();
            let probed = tokio::task::spawn_blocking(move || audio_core::probe_duration(&probe_path)).await;
            match probed {
                Ok(Ok(duration)) => segments.push(TimedSegment {
                    index: result.index,
                    text: item.text().to_string(),
                    voice: item.voice().to_string(),
                    file_path: path.clone(),
                    duration,
                }),
                Ok(Err(e)) => {
                    warn!(segment = %path.display(), error = %e, "could not probe segment duration");
                    unreadable.push(result.index);
                }
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "duration probe task failed");
                    unreadable.push(result.index);
                }
            }
        }
        if segments.is_empty() {
            return Err(BrokerError::NoSuccessfulItems {
                total: run.results.len(),
            });
        }
        if policy == FailurePolicy::Strict && !unreadable.is_empty() {
            return Err(BrokerError::IncompleteBatch { failed: unreadable });
        }

        let (timecodes, total_duration_ms) = timecodes::layout(segments, self.silence(&request));
        let stats = run.stats(unreadable.len());
        info!(
            total = stats.total_items,
            timed = timecodes.len(),
            total_duration_ms,
            "Batch timecodes computed"
        );

        Ok(TimecodeOutcome {
            results: run.results,
            stats,
            timecodes,
            total_duration_ms,
        })
    }

    fn item_request(
        &self,
        item: &BatchItem,
        batch: &BatchRequest,
        format: AudioFormat,
    ) -> Result<SynthesisRequest, BrokerError> {
        let voice = item
            .voice
            .as_deref()
            .or(batch.voice.as_deref())
            .unwrap_or(self.config.default_voice.as_str());
        let mut builder = SynthesisRequest::builder(item.text.as_str())
            .voice(voice)
            .format(format);
        if let Some(rate) = item.rate.as_deref().or(batch.rate.as_deref()) {
            builder = builder.rate(rate);
        }
        if let Some(volume) = item.volume.as_deref().or(batch.volume.as_deref()) {
            builder = builder.volume(volume);
        }
        if let Some(pitch) = item.pitch.as_deref().or(batch.pitch.as_deref()) {
            builder = builder.pitch(pitch);
        }
        builder.build()
    }

    async fn run_items(&self, batch: &BatchRequest) -> Result<ItemsRun, BrokerError> {
        if batch.items.is_empty() {
            return Err(BrokerError::InvalidRequest("Batch has no items".to_string()));
        }
        self.metrics.record_batch();
        let started = Instant::now();
        let format = batch.format.unwrap_or(self.config.default_format);

        let mut slots = Vec::with_capacity(batch.items.len());
        let mut requests = Vec::with_capacity(batch.items.len());
        let mut distinct: Vec<SynthesisRequest> = Vec::new();
        let mut first_seen: HashMap<Fingerprint, usize> = HashMap::new();

        for (index, item) in batch.items.iter().enumerate() {
            match self.item_request(item, batch, format) {
                Ok(request) => {
                    let fingerprint = request.fingerprint();
                    match first_seen.get(&fingerprint) {
                        Some(&first) => slots.push(Slot::Duplicate(first)),
                        None => {
                            first_seen.insert(fingerprint, index);
                            slots.push(Slot::Primary(distinct.len()));
                            distinct.push(request.clone());
                        }
                    }
                    requests.push(Some(request));
                }
                Err(e) => {
                    debug!(index, error = %e, "batch item rejected");
                    slots.push(Slot::Invalid(e.to_string()));
                    requests.push(None);
                }
            }
        }

        // Pinned before dispatch so later writes in this batch can't evict
        // earlier segments
        let lease = self.cache.lease(first_seen.into_keys());

        let cap = match batch.concurrency {
            Some(0) => 1,
            Some(n) => clamp_concurrency(n),
            None => self.config.max_concurrency,
        };
        let mode = if distinct.len() > 1 && cap > 1 {
            ProcessingMode::Concurrent
        } else {
            ProcessingMode::Serial
        };
        let options = SynthesisOptions {
            engine: batch.engine,
            fallback: batch.fallback,
        };
        let cancel = batch.cancel.clone().unwrap_or_else(CancellationToken::new);

        info!(
            items = batch.items.len(),
            distinct = distinct.len(),
            mode = ?mode,
            concurrency = cap,
            "Batch started"
        );

        let distinct_count = distinct.len();
        let outcomes = match mode {
            ProcessingMode::Concurrent => self.dispatch_concurrent(distinct, cap, options, &cancel).await,
            ProcessingMode::Serial => self.dispatch_serial(distinct, options, &cancel).await,
        };

        let mut results: Vec<BatchItemResult> = Vec::with_capacity(slots.len());
        for (index, slot) in slots.into_iter().enumerate() {
            let result = match slot {
                Slot::Invalid(error) => BatchItemResult::failed(index, error),
                Slot::Primary(pos) => match outcomes.get(pos) {
                    Some(outcome) => BatchItemResult::from_outcome(index, outcome),
                    None => BatchItemResult::failed(index, "missing synthesis result"),
                },
                Slot::Duplicate(first) => {
                    let mut copy = results[first].clone();
                    copy.index = index;
                    copy.duplicate_of = Some(first);
                    copy
                }
            };
            results.push(result);
        }

        Ok(ItemsRun {
            results,
            requests,
            distinct: distinct_count,
            mode,
            concurrency: if mode == ProcessingMode::Concurrent { cap } else { 1 },
            started,
            _lease: lease,
        })
    }

    /// At most `cap` calls in flight. Calls run in spawned tasks so they finish
    /// even if the batch future is dropped.
    async fn dispatch_concurrent(
        &self,
        requests: Vec<SynthesisRequest>,
        cap: usize,
        options: SynthesisOptions,
        cancel: &CancellationToken,
    ) -> Vec<Result<SynthesisOutcome, String>> {
        let semaphore = Arc::new(Semaphore::new(cap));
        let handles = requests.into_iter().map(|request| {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CANCELLED.to_string()),
                    permit = semaphore.acquire_owned() => permit.map_err(|e| e.to_string())?,
                };
                orchestrator
                    .synthesize(&request, &options)
                    .await
                    .map_err(|e| e.to_string())
            })
        });

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(format!("synthesis task failed: {e}"))))
            .collect()
    }

    async fn dispatch_serial(
        &self,
        requests: Vec<SynthesisRequest>,
        options: SynthesisOptions,
        cancel: &CancellationToken,
    ) -> Vec<Result<SynthesisOutcome, String>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            if cancel.is_cancelled() {
                outcomes.push(Err(CANCELLED.to_string()));
                continue;
            }
            let orchestrator = Arc::clone(&self.orchestrator);
            let handle = tokio::spawn(async move {
                orchestrator
                    .synthesize(&request, &options)
                    .await
                    .map_err(|e| e.to_string())
            });
            outcomes.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(format!("synthesis task failed: {e}"))),
            );
        }
        outcomes
    }
}
