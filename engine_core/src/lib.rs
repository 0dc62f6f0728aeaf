//! Speech engines: the Azure and Edge providers behind one capability set,
//! plus voice normalization and the provider error taxonomy.

mod azure;
mod edge;
mod error;
mod transport;
mod voice;

use std::{fmt, path::Path, str::FromStr};

use anyhow::Context;
use audio_core::AudioFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use azure::{azure_pitch, azure_rate, azure_volume, build_ssml, output_format, AzureCredentials, AzureEngine};
pub use edge::EdgeEngine;
pub use error::EngineError;
pub use transport::{RawVoice, SpeechTransport, SynthesisCall};
pub use voice::{fallback_voices, group_by_language, VoiceDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Azure,
    Edge,
}

impl EngineKind {
    /// The failover partner
    pub fn other(self) -> Self {
        match self {
            EngineKind::Azure => EngineKind::Edge,
            EngineKind::Edge => EngineKind::Azure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Azure => "azure",
            EngineKind::Edge => "edge",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "azure" => Ok(EngineKind::Azure),
            "edge" => Ok(EngineKind::Edge),
            other => Err(format!("unknown engine '{other}' (expected azure or edge)")),
        }
    }
}

/// Prosody and container for one synthesis call. Values are already
/// normalized (`+10%`, `-5Hz`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisParams {
    pub rate: String,
    pub volume: String,
    pub pitch: String,
    pub format: AudioFormat,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            rate: "+0%".to_string(),
            volume: "+0%".to_string(),
            pitch: "+0Hz".to_string(),
            format: AudioFormat::default(),
        }
    }
}

/// A configured speech engine
#[derive(Clone)]
pub enum Engine {
    Azure(AzureEngine),
    Edge(EdgeEngine),
}

impl Engine {
    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Azure(_) => EngineKind::Azure,
            Engine::Edge(_) => EngineKind::Edge,
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Engine::Azure(e) => e.is_available(),
            Engine::Edge(e) => e.is_available(),
        }
    }

    pub async fn list_voices(&self) -> Result<Vec<VoiceDescriptor>, EngineError> {
        match self {
            Engine::Azure(e) => e.list_voices().await,
            Engine::Edge(e) => e.list_voices().await,
        }
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        params: &SynthesisParams,
    ) -> Result<Vec<u8>, EngineError> {
        let audio = match self {
            Engine::Azure(e) => e.synthesize(text, voice, params).await?,
            Engine::Edge(e) => e.synthesize(text, voice, params).await?,
        };
        if audio.is_empty() {
            return Err(EngineError::Network(format!("{} returned no audio", self.kind())));
        }
        debug!(engine = %self.kind(), bytes = audio.len(), "synthesis call succeeded");
        Ok(audio)
    }

    /// Synthesize and write straight to `dest`. Returns the byte count.
    /// A partially written file is removed on failure.
    pub async fn synthesize_to_file(
        &self,
        text: &str,
        voice: &str,
        params: &SynthesisParams,
        dest: &Path,
    ) -> anyhow::Result<u64> {
        let audio = self.synthesize(text, voice, params).await?;

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        if let Err(err) = tokio::fs::write(dest, &audio).await {
            if tokio::fs::remove_file(dest).await.is_ok() {
                warn!(path = %dest.display(), "removed partial audio file");
            }
            return Err(err).with_context(|| format!("writing {}", dest.display()));
        }
        Ok(audio.len() as u64)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("kind", &self.kind())
            .field("available", &self.is_available())
            .finish()
    }
}
