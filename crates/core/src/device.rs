//! Capture and playback contracts consumed by the processing loop.
//!
//! Samples are always signed 16-bit mono at the rate passed to `open`.

use crate::config::SampleRate;
use crate::constants::{DEVICE_OPEN_ATTEMPTS, DEVICE_RETRY_BACKOFF_MS};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{DeviceError, PipelineError};
use std::thread;
use std::time::Duration;

/// Microphone side of the loop.
pub trait CaptureSource: Send {
    fn open(&mut self, rate: SampleRate) -> Result<(), DeviceError>;

    /// Blocks until `frame` is filled with the next block of samples.
    ///
    /// Implementations bound the wait and return [`DeviceError::Timeout`]
    /// rather than blocking forever.
    fn read_frame(&mut self, frame: &mut [i16]) -> Result<(), DeviceError>;

    fn stop(&mut self);

    fn release(&mut self);
}

/// Speaker side of the loop.
pub trait PlaybackSink: Send {
    fn open(&mut self, rate: SampleRate) -> Result<(), DeviceError>;

    fn write_frame(&mut self, frame: &[i16]) -> Result<(), DeviceError>;

    fn stop(&mut self);

    /// Discards audio queued but not yet rendered.
    fn flush(&mut self);
}

/// Calls `open` up to [`DEVICE_OPEN_ATTEMPTS`] times.
pub fn open_with_retry<F>(
    device: &'static str,
    diagnostics: &Diagnostics,
    mut open: F,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Result<(), DeviceError>,
{
    let mut attempt = 1;
    loop {
        match open() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < DEVICE_OPEN_ATTEMPTS => {
                diagnostics.emit(Diagnostic::DeviceRetry {
                    device,
                    attempt,
                    reason: e.to_string(),
                });
                attempt += 1;
                thread::sleep(Duration::from_millis(DEVICE_RETRY_BACKOFF_MS));
            }
            Err(e) => {
                diagnostics.emit(Diagnostic::DeviceFailed {
                    device,
                    reason: e.to_string(),
                });
                return Err(PipelineError::DeviceUnavailable {
                    device,
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_error() -> DeviceError {
        DeviceError::Open {
            device: "mic".into(),
            reason: "busy".into(),
        }
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let (diagnostics, rx) = Diagnostics::channel(8);
        let mut failures = 2;
        let result = open_with_retry("capture", &diagnostics, || {
            if failures > 0 {
                failures -= 1;
                Err(open_error())
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_retry_gives_up_after_fixed_attempts() {
        let (diagnostics, rx) = Diagnostics::channel(8);
        let mut calls = 0;
        let result = open_with_retry("playback", &diagnostics, || {
            calls += 1;
            Err(open_error())
        });
        assert_eq!(calls, DEVICE_OPEN_ATTEMPTS);
        assert!(matches!(
            result,
            Err(PipelineError::DeviceUnavailable { device: "playback", attempts, .. })
                if attempts == DEVICE_OPEN_ATTEMPTS
        ));
        let failed = rx
            .try_iter()
            .filter(|e| matches!(e, Diagnostic::DeviceFailed { .. }))
            .count();
        assert_eq!(failed, 1);
    }
}
