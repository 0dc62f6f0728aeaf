//! Common utilities for broker integration tests

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use audio_core::{encode_wav, AudioFormat, PcmBuffer};
use broker::{Broker, BrokerConfig, MergeTool};
use engine_core::{AzureCredentials, EngineError, RawVoice, SpeechTransport, SynthesisCall};

pub const SAMPLE_RATE: u32 = 16_000;

/// In-memory speech service. Returns a WAV tone per call and fails on
/// request according to its script.
pub struct ScriptedTransport {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
    tone: Duration,
    always: Option<EngineError>,
    first_failures: Mutex<VecDeque<EngineError>>,
    failing_texts: HashMap<String, EngineError>,
    voices: Vec<RawVoice>,
    texts: Mutex<Vec<String>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
            tone: Duration::from_millis(1000),
            always: None,
            first_failures: Mutex::new(VecDeque::new()),
            failing_texts: HashMap::new(),
            voices: Vec::new(),
            texts: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn with_tone(mut self, ms: u64) -> Self {
        self.tone = Duration::from_millis(ms);
        self
    }

    pub fn failing_with(mut self, error: EngineError) -> Self {
        self.always = Some(error);
        self
    }

    pub fn failing_first(self, n: usize, error: EngineError) -> Self {
        {
            let mut queue = self.first_failures.lock().unwrap();
            for _ in 0..n {
                queue.push_back(error.clone());
            }
        }
        self
    }

    pub fn failing_text(mut self, text: &str, error: EngineError) -> Self {
        self.failing_texts.insert(text.to_string(), error);
        self
    }

    pub fn with_voices(mut self, names: &[&str]) -> Self {
        self.voices = names
            .iter()
            .map(|name| RawVoice {
                short_name: name.to_string(),
                locale: name.splitn(3, '-').take(2).collect::<Vec<_>>().join("-"),
                gender: "Female".to_string(),
                local_name: "Test".to_string(),
                display_name: name.to_string(),
            })
            .collect();
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    fn tone_wav(&self) -> Vec<u8> {
        let frames = (self.tone.as_secs_f64() * SAMPLE_RATE as f64) as usize;
        encode_wav(&PcmBuffer::new(vec![0.2; frames], SAMPLE_RATE)).unwrap()
    }
}

#[async_trait]
impl SpeechTransport for ScriptedTransport {
    async fn synthesize(&self, call: &SynthesisCall) -> Result<Vec<u8>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(call.text.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = &self.always {
            return Err(error.clone());
        }
        if let Some(error) = self.first_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.failing_texts.get(&call.text) {
            return Err(error.clone());
        }
        Ok(self.tone_wav())
    }

    async fn list_voices(
        &self,
        _credentials: Option<&AzureCredentials>,
    ) -> Result<Vec<RawVoice>, EngineError> {
        if let Some(error) = &self.always {
            return Err(error.clone());
        }
        Ok(self.voices.clone())
    }
}

/// Config rooted in a scratch dir: fast retries, WAV output, no ffmpeg.
pub fn test_config(dir: &Path) -> BrokerConfig {
    BrokerConfig {
        azure_key: Some("test-key".to_string()),
        cache_dir: dir.join("cache"),
        output_dir: dir.join("out"),
        default_format: AudioFormat::Wav,
        max_concurrency: 4,
        retry_base_ms: 1,
        retry_max_ms: 5,
        merge_tool: MergeTool::Disabled,
        ..Default::default()
    }
}

pub async fn start_broker(
    config: BrokerConfig,
    azure: &Arc<ScriptedTransport>,
    edge: &Arc<ScriptedTransport>,
) -> Broker {
    broker::init_tracing();
    Broker::new(config, azure.clone(), edge.clone())
        .await
        .expect("Failed to create broker for tests")
}
