use std::{path::Path, time::Duration};

use anyhow::Context;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{pcm::PcmBuffer, wav};

/// Decode any supported segment into a mono buffer. WAV goes through hound,
/// everything else through symphonia.
pub fn decode_file(path: &Path) -> anyhow::Result<PcmBuffer> {
    let ext = extension(path);
    if ext == "wav" {
        // Some providers label RIFF data oddly; let symphonia have a go if hound refuses.
        return wav::read_wav(path).or_else(|_| decode_with_symphonia(path, &ext));
    }
    decode_with_symphonia(path, &ext)
}

/// Playback length of a WAV or MP3 file.
pub fn probe_duration(path: &Path) -> anyhow::Result<Duration> {
    if extension(path) == "wav" {
        if let Ok(reader) = hound::WavReader::open(path) {
            let spec = reader.spec();
            // duration() is already per-channel frames
            return Ok(Duration::from_secs_f64(
                reader.duration() as f64 / spec.sample_rate as f64,
            ));
        }
    }
    Ok(decode_file(path)?.duration())
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn decode_with_symphonia(path: &Path, ext: &str) -> anyhow::Result<PcmBuffer> {
    let src = std::fs::File::open(path)
        .with_context(|| format!("Failed to open segment {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(src), MediaSourceStreamOptions::default());

    let mut hint = Hint::new();
    if !ext.is_empty() {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| anyhow::anyhow!("probe error for {}: {e}", path.display()))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no audio track in {}", path.display()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow::anyhow!("unknown sample rate in {}", path.display()))?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow::anyhow!("codec error for {}: {e}", path.display()))?;

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut interleaved: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => break,
            Err(e) => anyhow::bail!("demux error in {}: {e}", path.display()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let sb = sample_buf.get_or_insert_with(|| {
                    SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())
                });
                sb.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(sb.samples());
            }
            // a corrupt frame is skipped, not fatal
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => anyhow::bail!("decode error in {}: {e}", path.display()),
        }
    }

    if interleaved.is_empty() {
        anyhow::bail!("no audio decoded from {}", path.display());
    }

    Ok(PcmBuffer::from_interleaved(&interleaved, channels, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::encode_wav;

    #[test]
    fn test_probe_duration_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one_second.wav");
        let pcm = PcmBuffer::new(vec![0.0; 24_000], 24_000);
        std::fs::write(&path, encode_wav(&pcm).unwrap()).unwrap();

        let d = probe_duration(&path).unwrap();
        assert!((d.as_secs_f64() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(decode_file(&path).is_err());
    }
}
