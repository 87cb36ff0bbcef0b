//! The contract every echo-cancellation engine exposes.
//!
//! An engine is a stateful native unit addressed through opaque handles.
//! Instances are allocated by [`EchoEngine::create`], bound to a sample rate
//! by [`EchoEngine::initialize`] and released by [`EchoEngine::free`]. The
//! engine itself does not enforce call order beyond rejecting calls on
//! unknown or uninitialised handles; [`crate::EchoController`] owns the
//! sequencing.

use crate::config::{EngineConfig, SampleRate};
use crate::error::EngineError;
use crate::frame::Frame;
use std::fmt;

/// Opaque identifier of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(i64);

impl EngineHandle {
    /// Sentinel returned by a failed `create()`.
    pub const INVALID: EngineHandle = EngineHandle(-1);

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub trait EchoEngine: Send {
    /// Allocates an instance without initialising DSP state.
    /// Returns [`EngineHandle::INVALID`] on failure.
    fn create(&mut self) -> EngineHandle;

    /// Binds the instance to a sample rate. Must precede any processing call.
    fn initialize(&mut self, handle: EngineHandle, rate: SampleRate) -> Result<(), EngineError>;

    /// Applies aggressiveness and comfort-noise settings.
    fn set_config(&mut self, handle: EngineHandle, config: &EngineConfig)
        -> Result<(), EngineError>;

    /// Appends one far-end reference frame for the next `process` call.
    fn buffer_farend(&mut self, handle: EngineHandle, farend: &[i16]) -> Result<(), EngineError>;

    /// Produces one echo-suppressed frame of the same length as `nearend_noisy`.
    ///
    /// `delay_ms` is the render/capture delay estimate:
    /// `(t_render - t_analyze) + (t_process - t_capture)`.
    fn process(
        &mut self,
        handle: EngineHandle,
        nearend_noisy: &[i16],
        nearend_clean: Option<&[i16]>,
        num_samples: i16,
        delay_ms: i16,
    ) -> Result<Frame, EngineError>;

    /// Releases the instance. The handle is invalid afterwards.
    fn free(&mut self, handle: EngineHandle) -> Result<(), EngineError>;
}

impl<T: EchoEngine + ?Sized> EchoEngine for Box<T> {
    fn create(&mut self) -> EngineHandle {
        (**self).create()
    }

    fn initialize(&mut self, handle: EngineHandle, rate: SampleRate) -> Result<(), EngineError> {
        (**self).initialize(handle, rate)
    }

    fn set_config(
        &mut self,
        handle: EngineHandle,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        (**self).set_config(handle, config)
    }

    fn buffer_farend(&mut self, handle: EngineHandle, farend: &[i16]) -> Result<(), EngineError> {
        (**self).buffer_farend(handle, farend)
    }

    fn process(
        &mut self,
        handle: EngineHandle,
        nearend_noisy: &[i16],
        nearend_clean: Option<&[i16]>,
        num_samples: i16,
        delay_ms: i16,
    ) -> Result<Frame, EngineError> {
        (**self).process(handle, nearend_noisy, nearend_clean, num_samples, delay_ms)
    }

    fn free(&mut self, handle: EngineHandle) -> Result<(), EngineError> {
        (**self).free(handle)
    }
}
