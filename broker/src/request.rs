use std::fmt;

use audio_core::AudioFormat;
use engine_core::SynthesisParams;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::BrokerError, validation};

pub const DEFAULT_VOICE: &str = "zh-CN-XiaoxiaoNeural";

/// Content fingerprint of a normalized request (lower-case hex SHA-256).
/// Used as cache key and as the batch dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts only the 64-char lower-case hex form
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(s.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated, normalized synthesis request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisRequest {
    text: String,
    voice: String,
    rate: String,
    volume: String,
    pitch: String,
    format: AudioFormat,
}

impl SynthesisRequest {
    pub fn builder(text: impl Into<String>) -> SynthesisRequestBuilder {
        SynthesisRequestBuilder {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn rate(&self) -> &str {
        &self.rate
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn pitch(&self) -> &str {
        &self.pitch
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn params(&self) -> SynthesisParams {
        SynthesisParams {
            rate: self.rate.clone(),
            volume: self.volume.clone(),
            pitch: self.pitch.clone(),
            format: self.format,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        // Length-prefix every field so field boundaries can't shift
        for field in [
            self.text.as_str(),
            self.voice.as_str(),
            self.rate.as_str(),
            self.volume.as_str(),
            self.pitch.as_str(),
            self.format.extension(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisRequestBuilder {
    text: String,
    voice: Option<String>,
    rate: Option<String>,
    volume: Option<String>,
    pitch: Option<String>,
    format: Option<AudioFormat>,
}

impl SynthesisRequestBuilder {
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn rate(mut self, rate: impl Into<String>) -> Self {
        self.rate = Some(rate.into());
        self
    }

    pub fn volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = Some(volume.into());
        self
    }

    pub fn pitch(mut self, pitch: impl Into<String>) -> Self {
        self.pitch = Some(pitch.into());
        self
    }

    pub fn format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn build(self) -> Result<SynthesisRequest, BrokerError> {
        Ok(SynthesisRequest {
            text: validation::validate_text(&self.text)?,
            voice: validation::validate_voice(self.voice.as_deref().unwrap_or(DEFAULT_VOICE))?,
            rate: validation::normalize_rate(self.rate.as_deref().unwrap_or("+0%"))?,
            volume: validation::normalize_volume(self.volume.as_deref().unwrap_or("+0%"))?,
            pitch: validation::normalize_pitch(self.pitch.as_deref().unwrap_or("+0Hz"))?,
            format: self.format.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> SynthesisRequest {
        SynthesisRequest::builder(text).build().unwrap()
    }

    #[test]
    fn test_builder_normalizes() {
        let req = SynthesisRequest::builder("  hello ")
            .voice("en-US-JennyNeural")
            .rate("10%")
            .pitch("0")
            .format(AudioFormat::Wav)
            .build()
            .unwrap();
        assert_eq!(req.text(), "hello");
        assert_eq!(req.rate(), "+10%");
        assert_eq!(req.volume(), "+0%");
        assert_eq!(req.pitch(), "+0Hz");
        assert_eq!(req.format(), AudioFormat::Wav);
    }

    #[test]
    fn test_builder_rejects_empty_text() {
        assert!(matches!(
            SynthesisRequest::builder(" \n").build(),
            Err(BrokerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = request("你好").fingerprint();
        assert_eq!(fp, request("你好").fingerprint());
        assert_eq!(fp.as_str().len(), 64);
        assert!(Fingerprint::parse(fp.as_str()).is_some());
    }

    #[test]
    fn test_equivalent_spellings_share_a_fingerprint() {
        let a = SynthesisRequest::builder("hi").rate("0%").build().unwrap();
        let b = SynthesisRequest::builder(" hi").rate("+0").build().unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_every_field_changes_the_fingerprint() {
        let base = request("hello").fingerprint();
        let variants = [
            SynthesisRequest::builder("hello!").build().unwrap(),
            SynthesisRequest::builder("hello").voice("en-US-JennyNeural").build().unwrap(),
            SynthesisRequest::builder("hello").rate("+5%").build().unwrap(),
            SynthesisRequest::builder("hello").volume("+5%").build().unwrap(),
            SynthesisRequest::builder("hello").pitch("+5Hz").build().unwrap(),
            SynthesisRequest::builder("hello").format(AudioFormat::Wav).build().unwrap(),
        ];
        for v in variants {
            assert_ne!(v.fingerprint(), base, "{v:?}");
        }
    }
}
