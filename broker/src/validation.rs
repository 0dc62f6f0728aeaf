use audio_core::AudioFormat;

use crate::error::BrokerError;

/// Maximum text length for one synthesis item
const MAX_TEXT_LENGTH: usize = 5000;
/// Maximum length of a caller-chosen output name
const MAX_NAME_LENGTH: usize = 128;

pub const RATE_RANGE: (i32, i32) = (-100, 200);
pub const VOLUME_RANGE: (i32, i32) = (-100, 100);
pub const PITCH_RANGE: (i32, i32) = (-100, 100);

/// Trim and check item text
pub fn validate_text(text: &str) -> Result<String, BrokerError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(BrokerError::InvalidRequest("Text cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(BrokerError::InvalidRequest(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }
    Ok(text.to_string())
}

/// Voice short names look like `zh-CN-XiaoxiaoNeural`
pub fn validate_voice(voice: &str) -> Result<String, BrokerError> {
    let voice = voice.trim();
    if voice.is_empty() {
        return Err(BrokerError::InvalidRequest("Voice cannot be empty".to_string()));
    }
    if !voice.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(BrokerError::InvalidRequest(format!("Invalid voice name: {voice}")));
    }
    Ok(voice.to_string())
}

fn parse_signed(value: &str, unit: &str, field: &str, range: (i32, i32)) -> Result<i32, BrokerError> {
    let trimmed = value.trim();
    let unit_at = trimmed.len().checked_sub(unit.len());
    let number = match unit_at.and_then(|at| trimmed.get(at..).map(|tail| (at, tail))) {
        Some((at, tail)) if tail.eq_ignore_ascii_case(unit) => &trimmed[..at],
        _ => trimmed,
    };
    let number = number.trim();
    let digits = number.strip_prefix('+').unwrap_or(number);

    let parsed: i32 = digits.parse().map_err(|_| {
        BrokerError::InvalidRequest(format!("Invalid {field}: '{value}'. Expected e.g. +10{unit}"))
    })?;

    if parsed < range.0 || parsed > range.1 {
        return Err(BrokerError::InvalidRequest(format!(
            "{field} out of range: {parsed}{unit} (allowed {}{unit} to +{}{unit})",
            range.0, range.1
        )));
    }
    Ok(parsed)
}

fn format_signed(value: i32, unit: &str) -> String {
    if value < 0 {
        format!("{value}{unit}")
    } else {
        format!("+{value}{unit}")
    }
}

/// `10%`, `+10`, `0%` -> `+10%`, `+10%`, `+0%`
pub fn normalize_rate(rate: &str) -> Result<String, BrokerError> {
    parse_signed(rate, "%", "rate", RATE_RANGE).map(|v| format_signed(v, "%"))
}

pub fn normalize_volume(volume: &str) -> Result<String, BrokerError> {
    parse_signed(volume, "%", "volume", VOLUME_RANGE).map(|v| format_signed(v, "%"))
}

/// `5hz`, `-3Hz`, `0` -> `+5Hz`, `-3Hz`, `+0Hz`
pub fn normalize_pitch(pitch: &str) -> Result<String, BrokerError> {
    parse_signed(pitch, "Hz", "pitch", PITCH_RANGE).map(|v| format_signed(v, "Hz"))
}

/// File name for an output in the output directory. A caller-supplied name
/// must be a bare file name; its extension is forced to `format`. Without
/// one, `<prefix>_<uuid>.<ext>` is generated.
pub fn output_file_name(
    requested: Option<&str>,
    prefix: &str,
    format: AudioFormat,
) -> Result<String, BrokerError> {
    let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(format!("{prefix}_{}.{}", uuid::Uuid::new_v4().simple(), format.extension()));
    };

    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(BrokerError::InvalidRequest(format!(
            "Output name must not contain path separators: {name}"
        )));
    }
    if name.starts_with('.') {
        return Err(BrokerError::InvalidRequest(format!(
            "Output name must not start with a dot: {name}"
        )));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(BrokerError::InvalidRequest(format!(
            "Output name too long (max {} characters)",
            MAX_NAME_LENGTH
        )));
    }

    // Swap a known audio extension, append otherwise
    let stem = match name.rsplit_once('.') {
        Some((stem, ext)) if ext.parse::<AudioFormat>().is_ok() && !stem.is_empty() => stem,
        _ => name,
    };
    Ok(format!("{stem}.{}", format.extension()))
}
