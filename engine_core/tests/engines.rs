//! Engine behaviour against an in-memory transport

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use audio_core::AudioFormat;
use engine_core::{
    AzureCredentials, AzureEngine, EdgeEngine, Engine, EngineError, EngineKind, RawVoice,
    SpeechTransport, SynthesisCall, SynthesisParams,
};

#[derive(Default)]
struct RecordingTransport {
    calls: AtomicUsize,
    last_call: Mutex<Option<SynthesisCall>>,
    reply: Mutex<Option<Result<Vec<u8>, EngineError>>>,
}

impl RecordingTransport {
    fn replying(reply: Result<Vec<u8>, EngineError>) -> Arc<Self> {
        Arc::new(Self { reply: Mutex::new(Some(reply)), ..Default::default() })
    }
}

#[async_trait]
impl SpeechTransport for RecordingTransport {
    async fn synthesize(&self, call: &SynthesisCall) -> Result<Vec<u8>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_call.lock().unwrap() = Some(call.clone());
        self.reply.lock().unwrap().clone().unwrap_or_else(|| Ok(b"audio".to_vec()))
    }

    async fn list_voices(
        &self,
        credentials: Option<&AzureCredentials>,
    ) -> Result<Vec<RawVoice>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let locale = if credentials.is_some() { "zh-CN" } else { "en-US" };
        Ok(vec![RawVoice {
            short_name: format!("{locale}-TestNeural"),
            locale: locale.to_string(),
            gender: "Female".to_string(),
            local_name: "Test".to_string(),
            display_name: String::new(),
        }])
    }
}

fn params() -> SynthesisParams {
    SynthesisParams {
        rate: "+20%".to_string(),
        volume: "-10%".to_string(),
        pitch: "+5Hz".to_string(),
        format: AudioFormat::Wav,
    }
}

#[tokio::test]
async fn test_azure_without_credentials_never_calls_transport() {
    let transport = Arc::new(RecordingTransport::default());
    let engine = Engine::Azure(AzureEngine::new(None, transport.clone()));

    assert_eq!(engine.kind(), EngineKind::Azure);
    assert!(!engine.is_available());

    let err = engine.synthesize("hello", "en-US-JennyNeural", &params()).await.unwrap_err();
    assert!(matches!(err, EngineError::Auth(_)));
    assert!(matches!(engine.list_voices().await, Err(EngineError::Auth(_))));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_azure_sends_ssml_and_output_format() {
    let transport = Arc::new(RecordingTransport::default());
    let creds = AzureCredentials::new("k", "eastasia");
    let engine = Engine::Azure(AzureEngine::new(creds, transport.clone()));

    engine.synthesize("你好", "zh-CN-XiaoxiaoNeural", &params()).await.unwrap();

    let call = transport.last_call.lock().unwrap().clone().unwrap();
    let ssml = call.ssml.unwrap();
    assert!(ssml.contains("rate=\"1.2\" volume=\"40%\" pitch=\"+5%\""));
    assert!(ssml.contains("你好"));
    assert_eq!(call.output_format.as_deref(), Some("riff-48khz-16bit-mono-pcm"));
    assert_eq!(call.credentials.unwrap().region, "eastasia");
}

#[tokio::test]
async fn test_edge_passes_params_through() {
    let transport = Arc::new(RecordingTransport::default());
    let engine = Engine::Edge(EdgeEngine::new(transport.clone()));
    assert!(engine.is_available());

    engine.synthesize("hi", "en-US-JennyNeural", &params()).await.unwrap();

    let call = transport.last_call.lock().unwrap().clone().unwrap();
    assert_eq!(call.rate, "+20%");
    assert_eq!(call.volume, "-10%");
    assert_eq!(call.pitch, "+5Hz");
    assert!(call.ssml.is_none());
    assert!(call.credentials.is_none());
}

#[tokio::test]
async fn test_empty_audio_is_a_network_failure() {
    let transport = RecordingTransport::replying(Ok(Vec::new()));
    let engine = Engine::Edge(EdgeEngine::new(transport));

    let err = engine.synthesize("hi", "en-US-JennyNeural", &params()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_synthesize_to_file_creates_parent_dir() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("nested/deeper/out.wav");
    let engine = Engine::Edge(EdgeEngine::new(Arc::new(RecordingTransport::default())));

    let written = engine.synthesize_to_file("hi", "en-US-JennyNeural", &params(), &dest).await.unwrap();

    assert_eq!(written, 5);
    assert_eq!(std::fs::read(&dest).unwrap(), b"audio");
}

#[tokio::test]
async fn test_synthesize_to_file_leaves_nothing_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp3");
    let transport = RecordingTransport::replying(Err(EngineError::Quota("monthly cap".into())));
    let engine = Engine::Edge(EdgeEngine::new(transport));

    let err = engine.synthesize_to_file("hi", "en-US-JennyNeural", &params(), &dest).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Quota(_))));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_voice_listing_is_normalized() {
    let transport = Arc::new(RecordingTransport::default());
    let azure = Engine::Azure(AzureEngine::new(AzureCredentials::new("k", "westus"), transport.clone()));
    let edge = Engine::Edge(EdgeEngine::new(transport));

    let azure_voices = azure.list_voices().await.unwrap();
    assert_eq!(azure_voices[0].display_name, "China (Mainland) Test (Female)");

    let edge_voices = edge.list_voices().await.unwrap();
    assert_eq!(edge_voices[0].name, "en-US-TestNeural");
    assert_eq!(edge_voices[0].display_name, "en-US-TestNeural");
}
