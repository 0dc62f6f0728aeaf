use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

use crate::pcm::PcmBuffer;

// LAME works in 1152-sample frames; feed it a whole number of them at a time.
const CHUNK_SAMPLES: usize = 1152 * 64;

/// Encode mono samples as a 128 kbps MP3 stream.
pub fn encode_mp3(pcm: &PcmBuffer) -> anyhow::Result<Vec<u8>> {
    let mut builder =
        Builder::new().ok_or_else(|| anyhow::anyhow!("failed to create LAME builder"))?;
    builder
        .set_num_channels(1)
        .map_err(|e| anyhow::anyhow!("lame channels: {e:?}"))?;
    builder
        .set_sample_rate(pcm.sample_rate)
        .map_err(|e| anyhow::anyhow!("lame sample rate {}: {e:?}", pcm.sample_rate))?;
    builder
        .set_brate(Bitrate::Kbps128)
        .map_err(|e| anyhow::anyhow!("lame bitrate: {e:?}"))?;
    builder
        .set_quality(Quality::Good)
        .map_err(|e| anyhow::anyhow!("lame quality: {e:?}"))?;
    let mut encoder = builder
        .build()
        .map_err(|e| anyhow::anyhow!("lame init: {e:?}"))?;

    let pcm_i16 = pcm.to_i16();
    let mut out: Vec<u8> = Vec::with_capacity(pcm_i16.len() / 4 + 7200);

    for chunk in pcm_i16.chunks(CHUNK_SAMPLES) {
        out.reserve(mp3lame_encoder::max_required_buffer_size(chunk.len()));
        let written = encoder
            .encode(MonoPcm(chunk), out.spare_capacity_mut())
            .map_err(|e| anyhow::anyhow!("lame encode: {e:?}"))?;
        // SAFETY: the encoder initialised exactly `written` bytes of spare capacity
        unsafe {
            out.set_len(out.len().wrapping_add(written));
        }
    }

    out.reserve(7200);
    let written = encoder
        .flush::<FlushNoGap>(out.spare_capacity_mut())
        .map_err(|e| anyhow::anyhow!("lame flush: {e:?}"))?;
    // SAFETY: as above
    unsafe {
        out.set_len(out.len().wrapping_add(written));
    }

    Ok(out)
}
