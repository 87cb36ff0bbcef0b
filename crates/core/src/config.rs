//! Engine configuration values.
//!
//! The engine only understands a closed set of sample rates and aggressiveness
//! modes, so both are enums with checked construction from raw UI values.

use std::fmt;

/// Sampling frequency of the audio exchanged with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleRate {
    Hz8000,
    #[default]
    Hz16000,
}

impl SampleRate {
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            8000 => Some(Self::Hz8000),
            16000 => Some(Self::Hz16000),
            _ => None,
        }
    }

    pub fn hz(self) -> u32 {
        match self {
            Self::Hz8000 => 8000,
            Self::Hz16000 => 16000,
        }
    }

    /// Samples in one millisecond of audio at this rate.
    pub fn samples_per_ms(self) -> usize {
        self.hz() as usize / 1000
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.hz())
    }
}

/// How hard the engine suppresses residual echo.
///
/// Higher modes remove more echo at the cost of more near-end distortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum AggressiveMode {
    Mild,
    Medium,
    High,
    #[default]
    Aggressive,
    MostAggressive,
}

impl AggressiveMode {
    pub const ALL: [AggressiveMode; 5] = [
        Self::Mild,
        Self::Medium,
        Self::High,
        Self::Aggressive,
        Self::MostAggressive,
    ];

    /// Maps the 0..=4 index used by the control surface.
    pub fn from_index(index: i32) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> i16 {
        match self {
            Self::Mild => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Aggressive => 3,
            Self::MostAggressive => 4,
        }
    }
}

impl fmt::Display for AggressiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mild => "mild",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Aggressive => "aggressive",
            Self::MostAggressive => "most-aggressive",
        };
        f.write_str(name)
    }
}

/// Settings read by the engine when it is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub sample_rate: SampleRate,
    pub aggressiveness: AggressiveMode,
    pub comfort_noise: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::default(),
            aggressiveness: AggressiveMode::default(),
            comfort_noise: true,
        }
    }
}
