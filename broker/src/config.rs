// Broker configuration, read once at startup

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use audio_core::AudioFormat;
use engine_core::{AzureCredentials, EngineKind};
use serde::{Deserialize, Serialize};

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 20;
const DEFAULT_CONCURRENCY: usize = 10;

/// What a batch does when some items fail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Leave failed items out of the merge and report them
    #[default]
    Skip,
    /// Any failed item fails the whole batch
    Strict,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(FailurePolicy::Skip),
            "strict" => Ok(FailurePolicy::Strict),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

/// Where the external merge tool comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTool {
    /// Look for `ffmpeg` on PATH
    Detect,
    Path(PathBuf),
    Disabled,
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub engine: EngineKind,
    pub azure_key: Option<String>,
    pub azure_region: String,
    pub default_voice: String,
    pub default_format: AudioFormat,
    pub max_concurrency: usize,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cache_max_bytes: u64,
    pub cache_max_entries: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub fallback_enabled: bool,
    pub failure_policy: FailurePolicy,
    pub silence_ms: u64,
    pub merge_tool: MergeTool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Azure,
            azure_key: None,
            azure_region: "eastasia".to_string(),
            default_voice: "zh-CN-XiaoxiaoNeural".to_string(),
            default_format: AudioFormat::Mp3,
            max_concurrency: DEFAULT_CONCURRENCY,
            cache_dir: PathBuf::from("static/audio/cache"),
            output_dir: PathBuf::from("static/audio"),
            cache_max_bytes: 1000 * 1024 * 1024,
            cache_max_entries: 10_000,
            max_retries: 2,
            retry_base_ms: 500,
            retry_max_ms: 8000,
            fallback_enabled: true,
            failure_policy: FailurePolicy::Skip,
            silence_ms: 200,
            merge_tool: MergeTool::Detect,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        let defaults = Self::default();

        let engine = env_parse("TTS_ENGINE").unwrap_or(defaults.engine);

        let azure_key = std::env::var("AZURE_SPEECH_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let azure_region = std::env::var("AZURE_SPEECH_REGION")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.azure_region);

        let default_voice = std::env::var("TTS_DEFAULT_VOICE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.default_voice);

        let default_format = env_parse("TTS_DEFAULT_FORMAT").unwrap_or(defaults.default_format);

        let max_concurrency = env_parse::<usize>("MAX_CONCURRENT_TASKS")
            .map(clamp_concurrency)
            .unwrap_or_else(derive_concurrency);

        let cache_dir = std::env::var("TTS_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let output_dir = std::env::var("TTS_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let cache_max_bytes = env_parse::<u64>("CACHE_MAX_SIZE_MB")
            .map(megabytes)
            .unwrap_or(defaults.cache_max_bytes);

        let cache_max_entries = env_parse("CACHE_MAX_ENTRIES").unwrap_or(defaults.cache_max_entries);

        let max_retries = env_parse("TTS_MAX_RETRIES").unwrap_or(defaults.max_retries);

        let retry_base_ms = env_parse("TTS_RETRY_BASE_MS").unwrap_or(defaults.retry_base_ms);

        let retry_max_ms = env_parse("TTS_RETRY_MAX_MS").unwrap_or(defaults.retry_max_ms);

        let fallback_enabled = env_parse("TTS_FALLBACK_ENABLED").unwrap_or(defaults.fallback_enabled);

        let failure_policy = env_parse("TTS_BATCH_FAILURE_POLICY").unwrap_or(defaults.failure_policy);

        let silence_ms = env_parse("TTS_SILENCE_MS").unwrap_or(defaults.silence_ms);

        let merge_tool = match std::env::var("FFMPEG_PATH") {
            Ok(v) if v.trim().eq_ignore_ascii_case("off") => MergeTool::Disabled,
            Ok(v) if !v.trim().is_empty() => MergeTool::Path(PathBuf::from(v.trim())),
            _ => MergeTool::Detect,
        };

        Self {
            engine,
            azure_key,
            azure_region,
            default_voice,
            default_format,
            max_concurrency,
            cache_dir,
            output_dir,
            cache_max_bytes,
            cache_max_entries,
            max_retries,
            retry_base_ms,
            retry_max_ms,
            fallback_enabled,
            failure_policy,
            silence_ms,
            merge_tool,
        }
    }

    pub fn azure_credentials(&self) -> Option<AzureCredentials> {
        self.azure_key
            .as_deref()
            .and_then(|key| AzureCredentials::new(key, self.azure_region.as_str()))
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("engine", &self.engine)
            .field("azure_key", &self.azure_key.as_ref().map(|_| "***"))
            .field("azure_region", &self.azure_region)
            .field("default_voice", &self.default_voice)
            .field("default_format", &self.default_format)
            .field("max_concurrency", &self.max_concurrency)
            .field("cache_dir", &self.cache_dir)
            .field("output_dir", &self.output_dir)
            .field("cache_max_bytes", &self.cache_max_bytes)
            .field("cache_max_entries", &self.cache_max_entries)
            .field("max_retries", &self.max_retries)
            .field("fallback_enabled", &self.fallback_enabled)
            .field("failure_policy", &self.failure_policy)
            .field("silence_ms", &self.silence_ms)
            .field("merge_tool", &self.merge_tool)
            .finish()
    }
}

/// Megabytes to bytes, saturating at `u64::MAX`
fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

/// Concurrency for this host: 1.5 x cores, halved under CPU or memory
/// pressure.
pub fn derive_concurrency() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpus = system.cpus().len();
    if cpus == 0 {
        return DEFAULT_CONCURRENCY;
    }
    let cpu_usage = system.global_cpu_info().cpu_usage();
    let memory_total = system.total_memory();
    let memory_usage = if memory_total > 0 {
        (system.used_memory() as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    concurrency_for(cpus, cpu_usage, memory_usage)
}

fn concurrency_for(cpus: usize, cpu_usage: f32, memory_usage: f32) -> usize {
    let mut n = cpus * 3 / 2;
    if cpu_usage > 80.0 || memory_usage > 85.0 {
        n /= 2;
    }
    clamp_concurrency(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_heuristic() {
        assert_eq!(concurrency_for(4, 10.0, 40.0), 6);
        assert_eq!(concurrency_for(4, 95.0, 40.0), 3);
        assert_eq!(concurrency_for(4, 10.0, 90.0), 3);
        assert_eq!(concurrency_for(1, 99.0, 99.0), 1);
        assert_eq!(concurrency_for(64, 0.0, 0.0), 20);
    }

    #[test]
    fn test_cache_size_in_megabytes_saturates() {
        assert_eq!(megabytes(1000), 1000 * 1024 * 1024);
        assert_eq!(megabytes(u64::MAX), u64::MAX);
        assert_eq!(megabytes(u64::MAX / 1024), u64::MAX);
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("STRICT".parse::<FailurePolicy>().unwrap(), FailurePolicy::Strict);
        assert_eq!("skip".parse::<FailurePolicy>().unwrap(), FailurePolicy::Skip);
        assert!("maybe".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_credentials_need_key() {
        let mut config = BrokerConfig::default();
        assert!(config.azure_credentials().is_none());
        config.azure_key = Some("k".to_string());
        assert_eq!(config.azure_credentials().unwrap().region, "eastasia");
    }

    #[test]
    fn test_debug_masks_key() {
        let config = BrokerConfig { azure_key: Some("super-secret".to_string()), ..Default::default() };
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
