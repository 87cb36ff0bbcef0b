//! Echo cancellation engine backed by the aec3 crate (Rust port of WebRTC AEC3).
//!
//! Exposes the handle-based engine contract over an instance registry. Each
//! instance runs AEC3 at 16kHz in 10ms blocks; 8kHz streams go through the
//! frame adapter's resampler.

use crate::config::{AggressiveMode, EngineConfig, SampleRate};
use crate::constants::ENGINE_RATE_HZ;
use crate::engine::{EchoEngine, EngineHandle};
use crate::error::EngineError;
use crate::frame::{validate_len, Frame};
use crate::frame_adapter::FrameAdapter;
use aec3::voip::VoipAec3;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Peak amplitude of the comfort noise (about -66 dBFS)
const COMFORT_NOISE_LEVEL: f32 = 0.0005;

/// Output/input energy ratio below which a block counts as suppressed
const SUPPRESSED_ENERGY_RATIO: f32 = 0.0625;

/// Share of the cancelled signal in the output for each mode.
fn suppression_strength(mode: AggressiveMode) -> f32 {
    match mode {
        AggressiveMode::Mild => 0.6,
        AggressiveMode::Medium => 0.7,
        AggressiveMode::High => 0.8,
        AggressiveMode::Aggressive => 0.9,
        AggressiveMode::MostAggressive => 1.0,
    }
}

fn energy(block: &[f32]) -> f32 {
    block.iter().map(|s| s * s).sum()
}

struct Canceller {
    aec: VoipAec3,
    adapter: FrameAdapter,
}

// SAFETY: a Canceller is owned by exactly one registry entry and is only
// reached through `&mut Aec3Engine`. The engine sits behind the controller
// mutex, so the AEC3 state is never aliased across threads, only moved.
unsafe impl Send for Canceller {}

struct Instance {
    canceller: Option<Canceller>,
    config: EngineConfig,
    rng: StdRng,
    last_delay_ms: Option<i16>,
}

impl Instance {
    fn new(seed: u64) -> Self {
        Self {
            canceller: None,
            config: EngineConfig::default(),
            rng: StdRng::seed_from_u64(seed),
            last_delay_ms: None,
        }
    }
}

/// Registry of AEC3 instances addressed by [`EngineHandle`].
#[derive(Default)]
pub struct Aec3Engine {
    instances: HashMap<EngineHandle, Instance>,
    next_handle: i64,
}

impl Aec3Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances that have been created and not yet freed.
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    fn instance(&mut self, handle: EngineHandle) -> Result<&mut Instance, EngineError> {
        self.instances
            .get_mut(&handle)
            .ok_or(EngineError::InvalidHandle {
                handle: handle.raw(),
            })
    }
}

impl EchoEngine for Aec3Engine {
    fn create(&mut self) -> EngineHandle {
        let handle = EngineHandle::from_raw(self.next_handle);
        self.next_handle += 1;
        self.instances
            .insert(handle, Instance::new(handle.raw() as u64));
        debug!("AEC3 instance {} created", handle);
        handle
    }

    fn initialize(&mut self, handle: EngineHandle, rate: SampleRate) -> Result<(), EngineError> {
        let instance = self.instance(handle)?;
        let aec = VoipAec3::builder(ENGINE_RATE_HZ as usize, 1, 1)
            .build()
            .map_err(|e| EngineError::InitFailed {
                rate,
                reason: format!("{:?}", e),
            })?;
        instance.canceller = Some(Canceller {
            aec,
            adapter: FrameAdapter::new(rate),
        });
        instance.last_delay_ms = None;
        info!("AEC3 instance {} initialized at {}", handle, rate);
        Ok(())
    }

    fn set_config(
        &mut self,
        handle: EngineHandle,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        let instance = self.instance(handle)?;
        if instance.canceller.is_none() {
            return Err(EngineError::NotInitialized {
                handle: handle.raw(),
            });
        }
        instance.config = *config;
        debug!(
            "AEC3 instance {} configured: mode={}, comfort_noise={}",
            handle, config.aggressiveness, config.comfort_noise
        );
        Ok(())
    }

    fn buffer_farend(&mut self, handle: EngineHandle, farend: &[i16]) -> Result<(), EngineError> {
        let instance = self.instance(handle)?;
        let canceller = instance
            .canceller
            .as_mut()
            .ok_or(EngineError::NotInitialized {
                handle: handle.raw(),
            })?;
        validate_len(farend)?;
        canceller.adapter.push_farend(farend);
        Ok(())
    }

    fn process(
        &mut self,
        handle: EngineHandle,
        nearend_noisy: &[i16],
        _nearend_clean: Option<&[i16]>,
        num_samples: i16,
        delay_ms: i16,
    ) -> Result<Frame, EngineError> {
        let instance = self.instance(handle)?;
        let Instance {
            canceller,
            config,
            rng,
            last_delay_ms,
        } = instance;
        let canceller = canceller.as_mut().ok_or(EngineError::NotInitialized {
            handle: handle.raw(),
        })?;
        validate_len(nearend_noisy)?;

        if num_samples as usize != nearend_noisy.len() {
            debug!(
                "Sample count {} differs from frame length {}; frame length wins",
                num_samples,
                nearend_noisy.len()
            );
        }
        // AEC3 tracks the render/capture delay itself; the estimate is advisory.
        if *last_delay_ms != Some(delay_ms) {
            debug!("AEC3 instance {} delay estimate now {}ms", handle, delay_ms);
            *last_delay_ms = Some(delay_ms);
        }

        let strength = suppression_strength(config.aggressiveness);
        let comfort_noise = config.comfort_noise;
        let aec = &mut canceller.aec;
        let mut out = vec![0i16; nearend_noisy.len()];
        // AEC3 suppresses noise internally; only the noisy track is fed to it.
        let processed =
            canceller
                .adapter
                .process_frame(nearend_noisy, &mut out, |near, far, block| {
                    aec.process(near, far, false, block)
                        .map_err(|e| EngineError::ProcessFailed {
                            reason: format!("{:?}", e),
                        })?;

                    for (o, &n) in block.iter_mut().zip(near.iter()) {
                        *o = n * (1.0 - strength) + *o * strength;
                    }

                    let near_energy = energy(near);
                    let suppressed = energy(block) < near_energy * SUPPRESSED_ENERGY_RATIO;
                    if comfort_noise && near_energy > 0.0 && suppressed {
                        for o in block.iter_mut() {
                            *o += rng.gen_range(-COMFORT_NOISE_LEVEL..COMFORT_NOISE_LEVEL);
                        }
                    }
                    Ok(())
                });
        processed?;
        Frame::new(out)
    }

    fn free(&mut self, handle: EngineHandle) -> Result<(), EngineError> {
        if self.instances.remove(&handle).is_none() {
            return Err(EngineError::InvalidHandle {
                handle: handle.raw(),
            });
        }
        debug!("AEC3 instance {} freed", handle);
        Ok(())
    }
}
