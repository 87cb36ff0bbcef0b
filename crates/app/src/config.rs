use anyhow::{Context, Result};
use directories::ProjectDirs;
use echoloop_core::constants::{DEFAULT_DELAY_MS, MIN_DELAY_MS};
use echoloop_core::{AggressiveMode, EngineConfig, FrameSize, LoopSettings, SampleRate};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Session settings read from `config.json` and overridden by CLI flags.
///
/// The file is only ever read; nothing is written back.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub input_device: String,
    #[serde(default = "default_device")]
    pub output_device: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,
    /// Samples per frame; `None` means the 10ms block of the sample rate
    #[serde(default)]
    pub frame_size: Option<usize>,
    #[serde(default = "default_aggressiveness")]
    pub aggressiveness_mode: i32,
    #[serde(default = "default_delay")]
    pub delay_estimate_ms: i32,
    #[serde(default)]
    pub echo_cancellation_enabled: bool,
    #[serde(default = "default_comfort_noise")]
    pub comfort_noise_enabled: bool,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    SampleRate::default().hz()
}

fn default_aggressiveness() -> i32 {
    AggressiveMode::default().index() as i32
}

fn default_delay() -> i32 {
    DEFAULT_DELAY_MS
}

fn default_comfort_noise() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_device: default_device(),
            output_device: default_device(),
            sample_rate_hz: default_sample_rate(),
            frame_size: None,
            aggressiveness_mode: default_aggressiveness(),
            delay_estimate_ms: default_delay(),
            echo_cancellation_enabled: false,
            comfort_noise_enabled: default_comfort_noise(),
        }
    }
}

/// Validated settings for one `run` session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub input_device: String,
    pub output_device: String,
    pub engine: EngineConfig,
    pub loop_settings: LoopSettings,
}

impl AppConfig {
    /// Loads the platform config file, or returns defaults if it is missing
    /// or unreadable.
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Ignoring {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Loads an explicitly named config file. Errors are not swallowed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    /// Maps the plain values onto core types, replacing anything invalid by
    /// its default.
    pub fn resolve(&self) -> SessionConfig {
        let sample_rate = SampleRate::from_hz(self.sample_rate_hz).unwrap_or_else(|| {
            let fallback = SampleRate::default();
            warn!(
                "Unsupported sample rate {}Hz, using {}",
                self.sample_rate_hz, fallback
            );
            fallback
        });

        let aggressiveness =
            AggressiveMode::from_index(self.aggressiveness_mode).unwrap_or_else(|| {
                let fallback = AggressiveMode::default();
                warn!(
                    "Unknown aggressiveness mode {}, using {}",
                    self.aggressiveness_mode, fallback
                );
                fallback
            });

        let block = FrameSize::for_rate(sample_rate);
        let frame_size = match self.frame_size {
            None => block,
            Some(len) => FrameSize::from_len(len).unwrap_or_else(|| {
                warn!(
                    "Unsupported frame size {}, using {} samples",
                    len,
                    block.len()
                );
                block
            }),
        };

        let delay_ms = if self.delay_estimate_ms < MIN_DELAY_MS {
            warn!(
                "Delay estimate {}ms below minimum, using {}ms",
                self.delay_estimate_ms, MIN_DELAY_MS
            );
            MIN_DELAY_MS
        } else {
            self.delay_estimate_ms
        };

        SessionConfig {
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            engine: EngineConfig {
                sample_rate,
                aggressiveness,
                comfort_noise: self.comfort_noise_enabled,
            },
            loop_settings: LoopSettings::new(sample_rate)
                .with_frame_size(frame_size)
                .with_delay_ms(delay_ms)
                .with_echo_cancellation(self.echo_cancellation_enabled),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "echoloop", "echoloop")
        .map(|dirs| dirs.config_dir().join("config.json"))
}
