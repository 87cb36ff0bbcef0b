//! Fixed-size blocks of signed 16-bit mono PCM.

use crate::config::SampleRate;
use crate::error::EngineError;
use std::time::Duration;

/// The two block lengths the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSize {
    Samples80,
    Samples160,
}

impl FrameSize {
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            80 => Some(Self::Samples80),
            160 => Some(Self::Samples160),
            _ => None,
        }
    }

    /// The 10ms block at `rate`.
    pub fn for_rate(rate: SampleRate) -> Self {
        match rate {
            SampleRate::Hz8000 => Self::Samples80,
            SampleRate::Hz16000 => Self::Samples160,
        }
    }

    pub fn len(self) -> usize {
        match self {
            Self::Samples80 => 80,
            Self::Samples160 => 160,
        }
    }

    /// Wall-clock length of one frame of this size at `rate`.
    pub fn duration_at(self, rate: SampleRate) -> Duration {
        Duration::from_micros(self.len() as u64 * 1_000_000 / rate.hz() as u64)
    }
}

/// Checks that `samples` has a length the engine accepts.
pub fn validate_len(samples: &[i16]) -> Result<FrameSize, EngineError> {
    FrameSize::from_len(samples.len())
        .ok_or(EngineError::InvalidFrameLength { len: samples.len() })
}

/// One block of audio with a length of exactly 80 or 160 samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Vec<i16>,
}

impl Frame {
    pub fn new(samples: Vec<i16>) -> Result<Self, EngineError> {
        validate_len(&samples)?;
        Ok(Self { samples })
    }

    pub fn silence(size: FrameSize) -> Self {
        Self {
            samples: vec![0; size.len()],
        }
    }

    pub fn size(&self) -> FrameSize {
        match self.samples.len() {
            80 => FrameSize::Samples80,
            _ => FrameSize::Samples160,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

impl AsRef<[i16]> for Frame {
    fn as_ref(&self) -> &[i16] {
        &self.samples
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Converts with saturation; out-of-range floats pin to the i16 bounds.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// 2x upsampler that interpolates against the last sample of the previous call.
#[derive(Debug, Default, Clone)]
pub struct Upsampler {
    last: f32,
}

impl Upsampler {
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        for &sample in input {
            out.push((self.last + sample) * 0.5);
            out.push(sample);
            self.last = sample;
        }
    }
}

/// Halves the rate by averaging sample pairs.
pub fn downsample_pairs(input: &[f32], out: &mut Vec<f32>) {
    for pair in input.chunks_exact(2) {
        out.push((pair[0] + pair[1]) * 0.5);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accepts_only_engine_lengths() {
        assert!(Frame::new(vec![0; 80]).is_ok());
        assert!(Frame::new(vec![0; 160]).is_ok());
        for len in [0, 1, 79, 81, 159, 161, 320] {
            assert_eq!(
                Frame::new(vec![0; len]),
                Err(EngineError::InvalidFrameLength { len })
            );
        }
    }

    #[test]
    fn test_frame_size_for_rate_is_ten_ms() {
        for rate in [SampleRate::Hz8000, SampleRate::Hz16000] {
            let size = FrameSize::for_rate(rate);
            assert_eq!(size.duration_at(rate), Duration::from_millis(10));
        }
        assert_eq!(
            FrameSize::Samples160.duration_at(SampleRate::Hz8000),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_pcm_conversion_saturates() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
        assert_eq!(f32_to_i16(i16_to_f32(1234)), 1234);
        assert_eq!(f32_to_i16(i16_to_f32(-32768)), -32768);
    }

    #[test]
    fn test_upsampler_interpolates_across_calls() {
        let mut up = Upsampler::default();
        let mut out = Vec::new();
        up.process(&[0.4], &mut out);
        up.process(&[0.8], &mut out);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.2).abs() < 1e-6);
        assert!((out[1] - 0.4).abs() < 1e-6);
        assert!((out[2] - 0.6).abs() < 1e-6);
        assert!((out[3] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_averages_pairs() {
        let mut out = Vec::new();
        downsample_pairs(&[0.2, 0.4, -0.5, 0.5], &mut out);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
    }
}
