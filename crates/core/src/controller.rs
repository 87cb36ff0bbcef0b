//! Engine controller: owns one engine instance and its lifecycle.
//!
//! The native engine has undefined behaviour when driven out of order, so every
//! call goes through the state machine below:
//!
//! ```text
//! Uninitialized --create--> Created --prepare--> Prepared --close--> Closed
//!                                      ^            |  ^                |
//!                                      |            +--+ (re-prepare)   |
//!                                      +-------- prepare (re-create) ---+
//! ```
//!
//! Processing calls (`farend`, `cancel_echo`) are legal only in `Prepared`.
//! Configuration setters always re-prepare, so new values take effect through
//! a fresh instance and never by mutating a prepared one in place.

use crate::config::{AggressiveMode, EngineConfig, SampleRate};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::{EchoEngine, EngineHandle};
use crate::error::EngineError;
use crate::frame::{validate_len, Frame};
use log::{debug, info, warn};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No instance exists yet (or creating one failed)
    Uninitialized,
    /// An instance is allocated but not bound to a sample rate
    Created,
    /// The instance is initialised and configured; processing is legal
    Prepared,
    /// The instance was released; `prepare()` creates a new one
    Closed,
}

/// Controller shared between the control path and the processing loop.
///
/// The mutex serialises every engine call, so a reconfiguration can never
/// interleave with a frame being processed.
pub type SharedController<E> = Arc<Mutex<EchoController<E>>>;

/// Locks a shared controller, mapping poisoning to [`EngineError::LockPoisoned`].
pub fn lock_controller<E: EchoEngine>(
    shared: &SharedController<E>,
) -> Result<MutexGuard<'_, EchoController<E>>, EngineError> {
    shared.lock().map_err(|_| EngineError::LockPoisoned)
}

pub struct EchoController<E: EchoEngine> {
    engine: E,
    handle: EngineHandle,
    state: LifecycleState,
    config: EngineConfig,
    diagnostics: Diagnostics,
    /// Set once a sequencing violation has been reported for the current
    /// unprepared period, so a running loop does not flood the log.
    violation_reported: bool,
}

impl<E: EchoEngine> EchoController<E> {
    /// Creates an engine instance with the default configuration.
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, EngineConfig::default())
    }

    pub fn with_config(engine: E, config: EngineConfig) -> Self {
        Self::with_diagnostics(engine, config, Diagnostics::disabled())
    }

    /// Creates an engine instance; a failed `create()` leaves the controller
    /// `Uninitialized` and the next `prepare()` retries the allocation.
    pub fn with_diagnostics(engine: E, config: EngineConfig, diagnostics: Diagnostics) -> Self {
        let mut controller = Self {
            engine,
            handle: EngineHandle::INVALID,
            state: LifecycleState::Uninitialized,
            config,
            diagnostics,
            violation_reported: false,
        };
        if let Err(e) = controller.create_instance() {
            warn!("Engine created without an instance: {}", e);
        }
        controller
    }

    pub fn into_shared(self) -> SharedController<E> {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_prepared(&self) -> bool {
        self.state == LifecycleState::Prepared
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn create_instance(&mut self) -> Result<(), EngineError> {
        let handle = self.engine.create();
        if !handle.is_valid() {
            return Err(EngineError::CreateFailed);
        }
        self.handle = handle;
        self.state = LifecycleState::Created;
        debug!("Engine instance {} created", handle);
        Ok(())
    }

    /// Frees the native instance, if any. Leaves the controller `Closed`.
    fn release_instance(&mut self) {
        if self.handle.is_valid() {
            if let Err(e) = self.engine.free(self.handle) {
                warn!("Freeing engine instance {} failed: {}", self.handle, e);
            }
            debug!("Engine instance {} freed", self.handle);
        }
        self.handle = EngineHandle::INVALID;
        self.state = LifecycleState::Closed;
    }

    fn prepare_failed(&mut self, err: EngineError) -> EngineError {
        self.diagnostics.emit(Diagnostic::PrepareFailed {
            reason: err.to_string(),
        });
        err
    }

    /// (Re)initialises the engine with the current configuration.
    ///
    /// A prepared instance is released first and replaced by a fresh one. On
    /// failure the controller is left unprepared and the error is returned.
    pub fn prepare(&mut self) -> Result<(), EngineError> {
        if self.state == LifecycleState::Prepared {
            self.release_instance();
        }
        if !self.handle.is_valid() {
            if let Err(e) = self.create_instance() {
                return Err(self.prepare_failed(e));
            }
        }

        let handle = self.handle;
        let setup = self
            .engine
            .initialize(handle, self.config.sample_rate)
            .and_then(|()| self.engine.set_config(handle, &self.config));
        if let Err(e) = setup {
            self.release_instance();
            return Err(self.prepare_failed(e));
        }

        self.state = LifecycleState::Prepared;
        self.violation_reported = false;
        info!(
            "Engine instance {} prepared at {} with {} mode, comfort noise {}",
            handle,
            self.config.sample_rate,
            self.config.aggressiveness,
            if self.config.comfort_noise { "on" } else { "off" }
        );
        Ok(())
    }

    fn or_default<T: Default + Display>(&self, value: Option<T>, setting: &'static str) -> T {
        value.unwrap_or_else(|| {
            let fallback = T::default();
            self.diagnostics.emit(Diagnostic::InputDefaulted {
                setting,
                fallback: fallback.to_string(),
            });
            fallback
        })
    }

    /// Sets the sample rate and re-prepares. `None` selects 16kHz.
    pub fn set_sample_rate(&mut self, rate: Option<SampleRate>) -> Result<(), EngineError> {
        self.config.sample_rate = self.or_default(rate, "sample rate");
        self.prepare()
    }

    /// Sets the aggressiveness and re-prepares. `None` selects `Aggressive`.
    pub fn set_aggressiveness(&mut self, mode: Option<AggressiveMode>) -> Result<(), EngineError> {
        self.config.aggressiveness = self.or_default(mode, "aggressiveness mode");
        self.prepare()
    }

    pub fn set_comfort_noise(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.config.comfort_noise = enabled;
        self.prepare()
    }

    /// Replaces the whole configuration with a single re-prepare.
    pub fn apply_config(&mut self, config: EngineConfig) -> Result<(), EngineError> {
        self.config = config;
        self.prepare()
    }

    fn ensure_prepared(&mut self, operation: &'static str) -> Result<(), EngineError> {
        if self.state == LifecycleState::Prepared {
            return Ok(());
        }
        if !self.violation_reported {
            self.violation_reported = true;
            self.diagnostics.emit(Diagnostic::SequencingViolation {
                operation,
                state: self.state,
            });
        }
        Err(EngineError::NotPrepared {
            operation,
            state: self.state,
        })
    }

    fn clamp_to_i16(&self, parameter: &'static str, value: i32) -> i16 {
        let applied = value.clamp(i16::MIN as i32, i16::MAX as i32);
        if applied != value {
            self.diagnostics.emit(Diagnostic::Clamped {
                parameter,
                requested: value as i64,
                applied: applied as i64,
            });
        }
        applied as i16
    }

    /// Buffers one far-end reference frame for the next `cancel_echo`.
    pub fn farend(&mut self, frame: &[i16]) -> Result<(), EngineError> {
        self.ensure_prepared("farend")?;
        validate_len(frame)?;
        self.engine.buffer_farend(self.handle, frame)
    }

    /// Runs cancellation on one near-end frame.
    ///
    /// `num_samples` and `delay_ms` outside the 16-bit signed range are clamped
    /// to the nearest bound; cancellation proceeds with the clamped values.
    pub fn cancel_echo(
        &mut self,
        nearend: &[i16],
        num_samples: i32,
        delay_ms: i32,
    ) -> Result<Frame, EngineError> {
        self.cancel_echo_with_clean(nearend, None, num_samples, delay_ms)
    }

    /// Like [`cancel_echo`](Self::cancel_echo) with an optional noise-reduced
    /// copy of the near-end signal.
    pub fn cancel_echo_with_clean(
        &mut self,
        nearend_noisy: &[i16],
        nearend_clean: Option<&[i16]>,
        num_samples: i32,
        delay_ms: i32,
    ) -> Result<Frame, EngineError> {
        self.ensure_prepared("cancel_echo")?;
        validate_len(nearend_noisy)?;
        if let Some(clean) = nearend_clean {
            if clean.len() != nearend_noisy.len() {
                return Err(EngineError::MismatchedNearend {
                    noisy: nearend_noisy.len(),
                    clean: clean.len(),
                });
            }
        }

        let num_samples = self.clamp_to_i16("num_samples", num_samples);
        let delay_ms = self.clamp_to_i16("delay_ms", delay_ms);
        self.engine
            .process(self.handle, nearend_noisy, nearend_clean, num_samples, delay_ms)
    }

    /// Releases the native instance. Safe to call repeatedly; the controller
    /// stays usable and a later `prepare()` creates a new instance.
    pub fn close(&mut self) {
        match self.state {
            LifecycleState::Created | LifecycleState::Prepared => {
                let handle = self.handle;
                self.release_instance();
                info!("Engine instance {} closed", handle);
            }
            LifecycleState::Uninitialized | LifecycleState::Closed => {
                debug!("close() on {:?} engine is a no-op", self.state)
            }
        }
    }
}

impl<E: EchoEngine> Drop for EchoController<E> {
    fn drop(&mut self) {
        self.close();
    }
}
