//! Shared constants for the echo loop.

/// Rate the bundled canceller runs at internally (16kHz)
pub const ENGINE_RATE_HZ: u32 = 16000;

/// Block size the bundled canceller consumes (10ms at 16kHz = 160 samples)
pub const ENGINE_BLOCK: usize = 160;

/// Default delay estimate handed to the engine, in milliseconds
pub const DEFAULT_DELAY_MS: i32 = 20;

/// Smallest delay estimate the configuration surface accepts
pub const MIN_DELAY_MS: i32 = 1;

/// Attempts made to open a capture or playback device before giving up
pub const DEVICE_OPEN_ATTEMPTS: u32 = 3;

/// Pause between device open attempts
pub const DEVICE_RETRY_BACKOFF_MS: u64 = 50;

/// Capacity of a diagnostics channel created with `Diagnostics::channel_default`
pub const DIAGNOSTICS_CAPACITY: usize = 256;
