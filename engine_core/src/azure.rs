use std::sync::Arc;

use audio_core::AudioFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    transport::{RawVoice, SpeechTransport, SynthesisCall},
    EngineError, SynthesisParams, VoiceDescriptor,
};

/// Subscription key + region for the Azure Speech service
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureCredentials {
    pub key: String,
    pub region: String,
}

impl AzureCredentials {
    /// Returns `None` when either part is blank.
    pub fn new(key: impl Into<String>, region: impl Into<String>) -> Option<Self> {
        let key = key.into().trim().to_string();
        let region = region.into().trim().to_string();
        if key.is_empty() || region.is_empty() {
            return None;
        }
        Some(Self { key, region })
    }

    pub fn synthesis_endpoint(&self) -> String {
        format!("https://{}.tts.speech.microsoft.com/cognitiveservices/v1", self.region)
    }

    pub fn voices_endpoint(&self) -> String {
        format!("https://{}.tts.speech.microsoft.com/cognitiveservices/voices/list", self.region)
    }

    pub fn token_endpoint(&self) -> String {
        format!("https://{}.api.cognitive.microsoft.com/sts/v1.0/issueToken", self.region)
    }
}

// Keep the key out of logs
impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("key", &"***")
            .field("region", &self.region)
            .finish()
    }
}

/// Azure Speech engine. Talks SSML to the service through `transport`.
#[derive(Clone)]
pub struct AzureEngine {
    credentials: Option<AzureCredentials>,
    transport: Arc<dyn SpeechTransport>,
}

impl AzureEngine {
    pub fn new(credentials: Option<AzureCredentials>, transport: Arc<dyn SpeechTransport>) -> Self {
        if credentials.is_none() {
            warn!("Azure engine created without credentials; it will report unavailable");
        }
        Self { credentials, transport }
    }

    pub fn is_available(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn region(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.region.as_str())
    }

    fn require_credentials(&self) -> Result<&AzureCredentials, EngineError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| EngineError::Auth("Azure speech key and region are not configured".to_string()))
    }

    pub async fn list_voices(&self) -> Result<Vec<VoiceDescriptor>, EngineError> {
        let credentials = self.require_credentials()?;
        let raw = self.transport.list_voices(Some(credentials)).await?;
        debug!(count = raw.len(), "Azure voices listed");
        Ok(raw.iter().map(normalize_voice).collect())
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        params: &SynthesisParams,
    ) -> Result<Vec<u8>, EngineError> {
        let credentials = self.require_credentials()?;
        let call = SynthesisCall {
            text: text.to_string(),
            voice: voice.to_string(),
            rate: params.rate.clone(),
            volume: params.volume.clone(),
            pitch: params.pitch.clone(),
            format: params.format,
            ssml: Some(build_ssml(text, voice, params)),
            output_format: Some(output_format(params.format).to_string()),
            credentials: Some(credentials.clone()),
        };
        self.transport.synthesize(&call).await
    }
}

/// Value of the `X-Microsoft-OutputFormat` header for a target format
pub fn output_format(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Wav => "riff-48khz-16bit-mono-pcm",
        AudioFormat::Mp3 => "audio-48khz-192kbitrate-mono-mp3",
    }
}

fn signed_value(value: &str, unit: &str) -> Option<i32> {
    let number = value.trim().strip_suffix(unit)?;
    let number = number.strip_prefix('+').unwrap_or(number);
    number.parse().ok()
}

/// `+20%` -> `1.2` (speaking-rate multiplier)
pub fn azure_rate(rate: &str) -> String {
    match signed_value(rate, "%") {
        Some(percent) => format!("{:.1}", 1.0 + percent as f64 / 100.0),
        None => "1.0".to_string(),
    }
}

/// `+10%` -> `60%` (absolute level around a 50% midpoint)
pub fn azure_volume(volume: &str) -> String {
    match signed_value(volume, "%") {
        Some(percent) => format!("{}%", (50 + percent).clamp(0, 100)),
        None => "50%".to_string(),
    }
}

/// `+5Hz` -> `+5%`
pub fn azure_pitch(pitch: &str) -> String {
    match signed_value(pitch, "Hz") {
        Some(hz) if hz < 0 => format!("{hz}%"),
        Some(hz) => format!("+{hz}%"),
        None => "+0%".to_string(),
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// SSML request body with prosody converted to Azure's conventions.
pub fn build_ssml(text: &str, voice: &str, params: &SynthesisParams) -> String {
    let lang = voice
        .splitn(3, '-')
        .take(2)
        .collect::<Vec<_>>()
        .join("-");
    let lang = if lang.contains('-') { lang } else { "zh-CN".to_string() };

    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" xml:lang=\"{lang}\">\
<voice name=\"{voice}\"><prosody rate=\"{rate}\" volume=\"{volume}\" pitch=\"{pitch}\">{text}</prosody></voice></speak>",
        lang = escape_xml(&lang),
        voice = escape_xml(voice),
        rate = azure_rate(&params.rate),
        volume = azure_volume(&params.volume),
        pitch = azure_pitch(&params.pitch),
        text = escape_xml(text),
    )
}

const REGION_NAMES: &[(&str, &str)] = &[
    ("zh-CN", "China (Mainland)"),
    ("zh-TW", "Taiwan"),
    ("zh-HK", "Hong Kong SAR"),
    ("ja-JP", "Japan"),
    ("en-US", "United States"),
    ("en-GB", "United Kingdom"),
    ("ko-KR", "Korea"),
    ("fr-FR", "France"),
    ("de-DE", "Germany"),
    ("es-ES", "Spain"),
    ("ru-RU", "Russia"),
    ("it-IT", "Italy"),
    ("pt-BR", "Brazil"),
    ("ar-SA", "Saudi Arabia"),
];

fn region_name(locale: &str) -> &str {
    REGION_NAMES
        .iter()
        .find(|(code, _)| *code == locale)
        .map(|(_, name)| *name)
        .unwrap_or(locale)
}

/// Azure reports no usable display name, so compose one.
fn normalize_voice(raw: &RawVoice) -> VoiceDescriptor {
    let label = if raw.local_name.is_empty() { &raw.short_name } else { &raw.local_name };
    let gender = if raw.gender.eq_ignore_ascii_case("female") { "Female" } else { "Male" };
    VoiceDescriptor {
        name: raw.short_name.clone(),
        locale: raw.locale.clone(),
        gender: raw.gender.clone(),
        display_name: format!("{} {} ({})", region_name(&raw.locale), label, gender),
    }
}
