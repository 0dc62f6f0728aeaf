use async_trait::async_trait;
use audio_core::AudioFormat;
use serde::{Deserialize, Serialize};

use crate::{azure::AzureCredentials, EngineError};

/// Everything a provider transport needs to make one synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisCall {
    pub text: String,
    pub voice: String,
    pub rate: String,
    pub volume: String,
    pub pitch: String,
    pub format: AudioFormat,
    /// Request body for providers that take SSML (Azure)
    pub ssml: Option<String>,
    /// Provider-specific output format name, e.g. `riff-48khz-16bit-mono-pcm`
    pub output_format: Option<String>,
    pub credentials: Option<AzureCredentials>,
}

/// Voice entry as the cloud services report it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawVoice {
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub local_name: String,
    #[serde(default)]
    pub display_name: String,
}

/// The raw network call to a speech service. Implementations own the HTTP or
/// websocket details and report failures already classified.
#[async_trait]
pub trait SpeechTransport: Send + Sync {
    async fn synthesize(&self, call: &SynthesisCall) -> Result<Vec<u8>, EngineError>;

    async fn list_voices(
        &self,
        credentials: Option<&AzureCredentials>,
    ) -> Result<Vec<RawVoice>, EngineError>;
}
