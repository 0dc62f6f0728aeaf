use std::time::Duration;

/// Mono f32 samples in [-1.0, 1.0] at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Build a mono buffer from interleaved samples by averaging channels
    pub fn from_interleaved(interleaved: &[f32], channels: usize, sample_rate: u32) -> Self {
        if channels <= 1 {
            return Self::new(interleaved.to_vec(), sample_rate);
        }
        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        Self::new(samples, sample_rate)
    }

    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        Self::new(vec![0.0; frames_for(duration, sample_rate)], sample_rate)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Linear-interpolation resample. Good enough for speech; the external
    /// tool path does proper filtering.
    pub fn resample(self, target_rate: u32) -> Self {
        if target_rate == 0 {
            return self;
        }
        if self.sample_rate == target_rate || self.samples.is_empty() {
            return Self::new(self.samples, target_rate);
        }

        let ratio = self.sample_rate as f64 / target_rate as f64;
        let out_len = (self.samples.len() as f64 / ratio).round() as usize;
        let last = self.samples.len() - 1;
        let mut out = Vec::with_capacity(out_len);
        for i in 0..out_len {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = self.samples[idx.min(last)];
            let b = self.samples[(idx + 1).min(last)];
            out.push(a + (b - a) * frac);
        }
        Self::new(out, target_rate)
    }

    pub fn append(&mut self, other: &PcmBuffer) {
        debug_assert_eq!(self.sample_rate, other.sample_rate);
        self.samples.extend_from_slice(&other.samples);
    }

    /// Clamp and convert to 16-bit PCM
    pub fn to_i16(&self) -> Vec<i16> {
        const I16_MAX_F32: f32 = i16::MAX as f32;
        self.samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16)
            .collect()
    }
}

pub(crate) fn frames_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        let pcm = PcmBuffer::from_interleaved(&[1.0, 0.0, 0.5, 0.5], 2, 8000);
        assert_eq!(pcm.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_preserves_duration() {
        let pcm = PcmBuffer::new(vec![0.1; 24_000], 24_000);
        let resampled = pcm.resample(48_000);
        assert_eq!(resampled.sample_rate, 48_000);
        assert_eq!(resampled.samples.len(), 48_000);
        assert!((resampled.duration().as_secs_f64() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_silence_length() {
        let silence = PcmBuffer::silence(Duration::from_millis(200), 16_000);
        assert_eq!(silence.samples.len(), 3_200);
        assert!(silence.samples.iter().all(|&s| s == 0.0));
    }
}
