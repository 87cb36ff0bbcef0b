//! Frame adapter for bridging 80/160-sample stream frames to the canceller's
//! fixed 10ms blocks at 16kHz.
//!
//! 8kHz streams are upsampled on the way in and downsampled on the way out,
//! so the canceller always sees `ENGINE_BLOCK` samples at `ENGINE_RATE_HZ`.

use crate::config::SampleRate;
use crate::constants::ENGINE_BLOCK;
use crate::error::EngineError;
use crate::frame::{downsample_pairs, f32_to_i16, i16_to_f32, Upsampler};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Enough headroom for a few 20ms frames in flight.
const RING_CAPACITY: usize = ENGINE_BLOCK * 8;

pub struct FrameAdapter {
    rate: SampleRate,
    rb_near: HeapRb<f32>,
    rb_far: HeapRb<f32>,
    rb_out: HeapRb<f32>,
    near_up: Upsampler,
    far_up: Upsampler,
    near_block: [f32; ENGINE_BLOCK],
    far_block: [f32; ENGINE_BLOCK],
    out_block: [f32; ENGINE_BLOCK],
    scratch: Vec<f32>,
    resampled: Vec<f32>,
}

impl FrameAdapter {
    pub fn new(rate: SampleRate) -> Self {
        Self {
            rate,
            rb_near: HeapRb::<f32>::new(RING_CAPACITY),
            rb_far: HeapRb::<f32>::new(RING_CAPACITY),
            rb_out: HeapRb::<f32>::new(RING_CAPACITY),
            near_up: Upsampler::default(),
            far_up: Upsampler::default(),
            near_block: [0.0; ENGINE_BLOCK],
            far_block: [0.0; ENGINE_BLOCK],
            out_block: [0.0; ENGINE_BLOCK],
            scratch: Vec::with_capacity(RING_CAPACITY),
            resampled: Vec::with_capacity(RING_CAPACITY),
        }
    }

    pub fn rate(&self) -> SampleRate {
        self.rate
    }

    /// Stream-rate samples per engine-rate sample pair.
    fn factor(&self) -> usize {
        match self.rate {
            SampleRate::Hz8000 => 2,
            SampleRate::Hz16000 => 1,
        }
    }

    /// Far-end samples waiting for a near-end block, at the engine rate.
    pub fn far_buffered(&self) -> usize {
        self.rb_far.occupied_len()
    }

    pub fn push_farend(&mut self, samples: &[i16]) {
        self.convert_in(samples, false);
        let _ = self.rb_far.push_slice(&self.resampled);
    }

    pub fn push_nearend(&mut self, samples: &[i16]) {
        self.convert_in(samples, true);
        let _ = self.rb_near.push_slice(&self.resampled);
    }

    fn convert_in(&mut self, samples: &[i16], near: bool) {
        self.scratch.clear();
        self.scratch.extend(samples.iter().copied().map(i16_to_f32));
        self.resampled.clear();
        match self.rate {
            SampleRate::Hz16000 => self.resampled.extend_from_slice(&self.scratch),
            SampleRate::Hz8000 => {
                let up = if near {
                    &mut self.near_up
                } else {
                    &mut self.far_up
                };
                up.process(&self.scratch, &mut self.resampled);
            }
        }
    }

    /// Runs `process` over every complete near-end block.
    ///
    /// The far-end argument is `None` when no reference block is buffered. A
    /// block whose processing fails is replaced by its raw near-end input so
    /// the output stream stays aligned; the first error is returned after all
    /// blocks have been drained.
    pub fn process_available<F>(&mut self, mut process: F) -> Result<usize, EngineError>
    where
        F: FnMut(&[f32], Option<&[f32]>, &mut [f32]) -> Result<(), EngineError>,
    {
        let mut blocks = 0;
        let mut first_error = None;

        while self.rb_near.occupied_len() >= ENGINE_BLOCK {
            self.rb_near.pop_slice(&mut self.near_block);
            let far = if self.rb_far.occupied_len() >= ENGINE_BLOCK {
                self.rb_far.pop_slice(&mut self.far_block);
                Some(&self.far_block[..])
            } else {
                None
            };

            self.out_block.fill(0.0);
            if let Err(e) = process(&self.near_block, far, &mut self.out_block) {
                self.out_block.copy_from_slice(&self.near_block);
                first_error.get_or_insert(e);
            }

            let _ = self.rb_out.push_slice(&self.out_block);
            blocks += 1;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(blocks),
        }
    }

    /// Pushes one near-end frame, processes every complete block and fills
    /// `out` with this frame's share of the output.
    ///
    /// `out` is filled even when a block fails, so the output queue never
    /// holds more than the blocks still waiting on the next frame.
    pub fn process_frame<F>(
        &mut self,
        nearend: &[i16],
        out: &mut [i16],
        process: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&[f32], Option<&[f32]>, &mut [f32]) -> Result<(), EngineError>,
    {
        self.push_nearend(nearend);
        let processed = self.process_available(process);
        self.pop_frame(out);
        processed.map(|_| ())
    }

    /// Fills `out` with processed stream-rate samples. Returns how many came
    /// from processed audio; the remainder is silence.
    pub fn pop_frame(&mut self, out: &mut [i16]) -> usize {
        let wanted = out.len() * self.factor();
        let available = self.rb_out.occupied_len().min(wanted);
        let available = available - available % self.factor();

        self.scratch.clear();
        self.scratch.resize(available, 0.0);
        self.rb_out.pop_slice(&mut self.scratch);

        self.resampled.clear();
        match self.rate {
            SampleRate::Hz16000 => self.resampled.extend_from_slice(&self.scratch),
            SampleRate::Hz8000 => downsample_pairs(&self.scratch, &mut self.resampled),
        }

        let filled = self.resampled.len().min(out.len());
        for (dst, &src) in out.iter_mut().zip(self.resampled.iter()) {
            *dst = f32_to_i16(src);
        }
        for dst in out.iter_mut().skip(filled) {
            *dst = 0;
        }
        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough(near: &[f32], _far: Option<&[f32]>, out: &mut [f32]) -> Result<(), EngineError> {
        out.copy_from_slice(near);
        Ok(())
    }

    #[test]
    fn test_full_block_at_16k_has_no_latency() {
        let mut adapter = FrameAdapter::new(SampleRate::Hz16000);
        let input: Vec<i16> = (0..160).map(|i| i * 10).collect();
        adapter.push_nearend(&input);

        assert_eq!(adapter.process_available(passthrough), Ok(1));

        let mut out = [0i16; 160];
        assert_eq!(adapter.pop_frame(&mut out), 160);
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    fn test_half_block_waits_for_second_frame() {
        let mut adapter = FrameAdapter::new(SampleRate::Hz16000);
        let mut out = [1i16; 80];

        adapter.push_nearend(&[100; 80]);
        assert_eq!(adapter.process_available(passthrough), Ok(0));
        assert_eq!(adapter.pop_frame(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0));

        adapter.push_nearend(&[200; 80]);
        assert_eq!(adapter.process_available(passthrough), Ok(1));
        assert_eq!(adapter.pop_frame(&mut out), 80);
        assert!(out.iter().all(|&s| s == 100));
    }

    #[test]
    fn test_8k_frame_is_resampled_to_one_block() {
        let mut adapter = FrameAdapter::new(SampleRate::Hz8000);
        let mut seen = 0;
        adapter.push_farend(&[500; 80]);
        adapter.push_nearend(&[500; 80]);
        assert_eq!(adapter.far_buffered(), 160);

        let blocks = adapter
            .process_available(|near, far, out| {
                seen = near.len();
                assert!(far.is_some());
                out.copy_from_slice(near);
                Ok(())
            })
            .unwrap();
        assert_eq!(blocks, 1);
        assert_eq!(seen, ENGINE_BLOCK);

        let mut out = [0i16; 80];
        assert_eq!(adapter.pop_frame(&mut out), 80);
        // First output sample blends against the zero history of the upsampler.
        assert!(out[1..].iter().all(|&s| s == 500));
    }

    #[test]
    fn test_missing_farend_passes_none() {
        let mut adapter = FrameAdapter::new(SampleRate::Hz16000);
        adapter.push_nearend(&[0; 160]);
        adapter
            .process_available(|_, far, _| {
                assert!(far.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_failed_block_falls_back_to_raw_input() {
        let mut adapter = FrameAdapter::new(SampleRate::Hz16000);
        adapter.push_nearend(&[321; 160]);
        let result = adapter.process_available(|_, _, _| {
            Err(EngineError::ProcessFailed {
                reason: "boom".into(),
            })
        });
        assert!(result.is_err());

        let mut out = [0i16; 160];
        assert_eq!(adapter.pop_frame(&mut out), 160);
        assert!(out.iter().all(|&s| s == 321));
    }

    #[test]
    fn test_failed_frame_does_not_delay_later_output() {
        let mut adapter = FrameAdapter::new(SampleRate::Hz16000);
        let mut out = [0i16; 160];

        let failed = adapter.process_frame(&[1; 160], &mut out, |_, _, _| {
            Err(EngineError::ProcessFailed {
                reason: "boom".into(),
            })
        });
        assert!(failed.is_err());
        assert!(out.iter().all(|&s| s == 1));

        adapter.process_frame(&[2; 160], &mut out, passthrough).unwrap();
        assert!(out.iter().all(|&s| s == 2));

        adapter.process_frame(&[3; 160], &mut out, passthrough).unwrap();
        assert!(out.iter().all(|&s| s == 3));
    }
}
