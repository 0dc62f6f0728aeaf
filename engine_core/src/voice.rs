use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provider-neutral voice description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    pub name: String,
    pub locale: String,
    pub gender: String,
    pub display_name: String,
}

impl VoiceDescriptor {
    pub fn new(name: &str, locale: &str, gender: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            locale: locale.to_string(),
            gender: gender.to_string(),
            display_name: display_name.to_string(),
        }
    }

    /// Two-letter language prefix: `zh-CN-XiaoxiaoNeural` -> `zh`
    pub fn language(&self) -> Option<&str> {
        let source = if self.locale.is_empty() { &self.name } else { &self.locale };
        let mut parts = source.split('-');
        let lang = parts.next()?;
        // A bare name with no dashes isn't a locale
        if parts.next().is_none() || lang.is_empty() {
            return None;
        }
        Some(lang)
    }
}

/// Bucket voices by language prefix, unknowns under `other`
pub fn group_by_language(voices: Vec<VoiceDescriptor>) -> BTreeMap<String, Vec<VoiceDescriptor>> {
    let mut grouped: BTreeMap<String, Vec<VoiceDescriptor>> = BTreeMap::new();
    for voice in voices {
        let key = voice.language().unwrap_or("other").to_ascii_lowercase();
        grouped.entry(key).or_default().push(voice);
    }
    grouped
}

/// Built-in list served when no provider can enumerate voices.
pub fn fallback_voices() -> Vec<VoiceDescriptor> {
    vec![
        VoiceDescriptor::new("zh-CN-XiaoxiaoNeural", "zh-CN", "Female", "China (Mainland) Xiaoxiao (Female)"),
        VoiceDescriptor::new("zh-CN-YunyangNeural", "zh-CN", "Male", "China (Mainland) Yunyang (Male)"),
        VoiceDescriptor::new("zh-CN-YunxiNeural", "zh-CN", "Male", "China (Mainland) Yunxi (Male)"),
        VoiceDescriptor::new("zh-CN-XiaomoNeural", "zh-CN", "Female", "China (Mainland) Xiaomo (Female)"),
        VoiceDescriptor::new("zh-CN-XiaoxuanNeural", "zh-CN", "Female", "China (Mainland) Xiaoxuan (Female)"),
        VoiceDescriptor::new("ja-JP-NanamiNeural", "ja-JP", "Female", "Japan Nanami (Female)"),
        VoiceDescriptor::new("ja-JP-KeitaNeural", "ja-JP", "Male", "Japan Keita (Male)"),
        VoiceDescriptor::new("en-US-JennyNeural", "en-US", "Female", "United States Jenny (Female)"),
        VoiceDescriptor::new("en-GB-SoniaNeural", "en-GB", "Female", "United Kingdom Sonia (Female)"),
    ]
}
