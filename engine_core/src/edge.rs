use std::sync::Arc;

use tracing::debug;

use crate::{
    transport::{RawVoice, SpeechTransport, SynthesisCall},
    EngineError, SynthesisParams, VoiceDescriptor,
};

/// Edge read-aloud engine: no credentials, parameters passed through as-is.
#[derive(Clone)]
pub struct EdgeEngine {
    transport: Arc<dyn SpeechTransport>,
}

impl EdgeEngine {
    pub fn new(transport: Arc<dyn SpeechTransport>) -> Self {
        Self { transport }
    }

    pub fn is_available(&self) -> bool {
        true
    }

    pub async fn list_voices(&self) -> Result<Vec<VoiceDescriptor>, EngineError> {
        let raw = self.transport.list_voices(None).await?;
        debug!(count = raw.len(), "Edge voices listed");
        Ok(raw.iter().map(normalize_voice).collect())
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        params: &SynthesisParams,
    ) -> Result<Vec<u8>, EngineError> {
        let call = SynthesisCall {
            text: text.to_string(),
            voice: voice.to_string(),
            rate: params.rate.clone(),
            volume: params.volume.clone(),
            pitch: params.pitch.clone(),
            format: params.format,
            ssml: None,
            output_format: None,
            credentials: None,
        };
        self.transport.synthesize(&call).await
    }
}

fn normalize_voice(raw: &RawVoice) -> VoiceDescriptor {
    let display_name = if raw.display_name.is_empty() {
        raw.short_name.clone()
    } else {
        raw.display_name.clone()
    };
    VoiceDescriptor {
        name: raw.short_name.clone(),
        locale: raw.locale.clone(),
        gender: raw.gender.clone(),
        display_name,
    }
}
