//! Error types for the engine, the audio devices and the processing loop.

use crate::config::SampleRate;
use crate::controller::LifecycleState;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the engine contract and the controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A processing call arrived while the controller was not prepared
    #[error("{operation} called while engine is {state:?}; prepare() first")]
    NotPrepared {
        operation: &'static str,
        state: LifecycleState,
    },

    /// Frame length other than 80 or 160 samples
    #[error("Invalid frame length: {len} samples (expected 80 or 160)")]
    InvalidFrameLength { len: usize },

    /// Near-end noisy and clean buffers disagree in length
    #[error("Clean near-end has {clean} samples but noisy near-end has {noisy}")]
    MismatchedNearend { noisy: usize, clean: usize },

    /// The engine could not allocate an instance
    #[error("Failed to create engine instance")]
    CreateFailed,

    /// The handle does not refer to a live instance
    #[error("Invalid engine handle {handle}")]
    InvalidHandle { handle: i64 },

    /// The instance exists but was never bound to a sample rate
    #[error("Engine instance {handle} is not initialized")]
    NotInitialized { handle: i64 },

    /// Binding the instance to a sample rate failed
    #[error("Engine initialization at {rate} failed: {reason}")]
    InitFailed { rate: SampleRate, reason: String },

    /// The engine rejected the aggressiveness / comfort-noise settings
    #[error("Engine rejected configuration: {reason}")]
    ConfigRejected { reason: String },

    /// The engine failed while processing a frame
    #[error("Echo cancellation failed: {reason}")]
    ProcessFailed { reason: String },

    /// The mutex guarding the controller was poisoned by a panicking holder
    #[error("Engine controller lock poisoned")]
    LockPoisoned,
}

/// Failures reported by capture sources and playback sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("{device} is not open")]
    NotOpen { device: String },

    /// No frame became available (or room to write one) in time
    #[error("{device} timed out after {after:?}")]
    Timeout { device: String, after: Duration },

    #[error("{device} stream failed: {reason}")]
    Stream { device: String, reason: String },

    #[error("Frame of {actual} samples does not match {device} frame size {expected}")]
    FrameSize {
        device: String,
        expected: usize,
        actual: usize,
    },
}

impl DeviceError {
    /// Timeouts leave the device usable; everything else ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. })
    }
}

/// Failures of the processing loop lifecycle.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Processing loop already running; stop() it first")]
    AlreadyRunning,

    #[error("Processing loop is not running")]
    NotRunning,

    #[error("Could not open {device} after {attempts} attempts: {source}")]
    DeviceUnavailable {
        device: &'static str,
        attempts: u32,
        #[source]
        source: DeviceError,
    },

    #[error("Failed to spawn audio processing thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Audio processing thread panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Engine(#[from] EngineError),
}
