//! Processing loop: one background worker pumping capture -> engine -> playback.
//!
//! ```text
//! start() --open devices--> worker: [stop?] read -> farend+cancel -> write
//!                                     ^                              |
//!                                     +------------------------------+
//! stop()  --flag, join--> capture.stop/release, sink.flush/stop
//! ```

use crate::config::SampleRate;
use crate::constants::{DEFAULT_DELAY_MS, MIN_DELAY_MS};
use crate::controller::{lock_controller, SharedController};
use crate::device::{open_with_retry, CaptureSource, PlaybackSink};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::EchoEngine;
use crate::error::{DeviceError, PipelineError};
use crate::frame::FrameSize;
use crate::processor::{FrameOutcome, FrameProcessor};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Parameters fixed for the lifetime of one loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub sample_rate: SampleRate,
    pub frame_size: FrameSize,
    /// Initial delay estimate; adjustable later through [`LoopControls`]
    pub delay_ms: i32,
    /// Initial cancellation switch; adjustable later through [`LoopControls`]
    pub echo_cancellation: bool,
}

impl LoopSettings {
    /// 10ms frames at `rate`, default delay, cancellation off.
    pub fn new(sample_rate: SampleRate) -> Self {
        Self {
            sample_rate,
            frame_size: FrameSize::for_rate(sample_rate),
            delay_ms: DEFAULT_DELAY_MS,
            echo_cancellation: false,
        }
    }

    pub fn with_frame_size(mut self, frame_size: FrameSize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: i32) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_echo_cancellation(mut self, enabled: bool) -> Self {
        self.echo_cancellation = enabled;
        self
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::new(SampleRate::default())
    }
}

/// Values the worker re-reads every iteration.
#[derive(Debug, Clone)]
pub struct LoopControls {
    echo_cancellation: Arc<AtomicBool>,
    delay_ms: Arc<AtomicI32>,
}

impl Default for LoopControls {
    fn default() -> Self {
        Self {
            echo_cancellation: Arc::new(AtomicBool::new(false)),
            delay_ms: Arc::new(AtomicI32::new(DEFAULT_DELAY_MS)),
        }
    }
}

impl LoopControls {
    pub fn echo_cancellation(&self) -> bool {
        self.echo_cancellation.load(Ordering::Relaxed)
    }

    pub fn set_echo_cancellation(&self, enabled: bool) {
        self.echo_cancellation.store(enabled, Ordering::Relaxed);
    }

    pub fn delay_ms(&self) -> i32 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    /// Estimates below 1ms are raised to 1ms.
    pub fn set_delay_ms(&self, delay_ms: i32) {
        self.delay_ms
            .store(delay_ms.max(MIN_DELAY_MS), Ordering::Relaxed);
    }
}

/// Counters collected by the worker over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Frames read from capture and handed to playback
    pub frames: u64,
    pub cancelled: u64,
    pub passed_through: u64,
    pub read_timeouts: u64,
    pub write_timeouts: u64,
    /// Set when a device failure ended the run
    pub device_error: Option<DeviceError>,
}

struct WorkerExit {
    stats: LoopStats,
    capture: Box<dyn CaptureSource>,
    sink: Box<dyn PlaybackSink>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<WorkerExit>,
}

/// Drives one [`crate::EchoController`] from captured audio.
///
/// At most one worker is active per loop; the controller may be shared with a
/// control path, which reconfigures it through the same mutex.
pub struct ProcessingLoop<E: EchoEngine + 'static> {
    controller: SharedController<E>,
    controls: LoopControls,
    diagnostics: Diagnostics,
    worker: Option<Worker>,
}

impl<E: EchoEngine + 'static> ProcessingLoop<E> {
    /// Uses the controller's diagnostics emitter for loop events.
    pub fn new(controller: SharedController<E>) -> Self {
        let diagnostics = match lock_controller(&controller) {
            Ok(guard) => guard.diagnostics().clone(),
            Err(e) => {
                warn!("{}; loop diagnostics are log-only", e);
                Diagnostics::disabled()
            }
        };
        Self {
            controller,
            controls: LoopControls::default(),
            diagnostics,
            worker: None,
        }
    }

    pub fn controller(&self) -> &SharedController<E> {
        &self.controller
    }

    pub fn controls(&self) -> LoopControls {
        self.controls.clone()
    }

    /// True while a worker exists and has not exited on its own.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Opens both devices and spawns the worker. Returns once the worker runs.
    ///
    /// An engine that cannot be prepared does not prevent the start; frames
    /// pass through until a later reconfiguration succeeds.
    pub fn start(
        &mut self,
        settings: LoopSettings,
        mut capture: Box<dyn CaptureSource>,
        mut sink: Box<dyn PlaybackSink>,
    ) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        if self.worker.is_some() {
            // The previous worker ended on a device failure; reap it first.
            if let Ok(stats) = self.stop() {
                debug!("Reaped finished worker: {:?}", stats);
            }
        }

        self.controls.set_echo_cancellation(settings.echo_cancellation);
        self.controls.set_delay_ms(settings.delay_ms);
        self.align_controller(settings.sample_rate)?;

        let rate = settings.sample_rate;
        open_with_retry("capture", &self.diagnostics, || capture.open(rate))?;
        if let Err(e) = open_with_retry("playback", &self.diagnostics, || sink.open(rate)) {
            capture.release();
            return Err(e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let processor = FrameProcessor::new(Arc::clone(&self.controller));
        let controls = self.controls.clone();
        let diagnostics = self.diagnostics.clone();
        let frame_size = settings.frame_size;
        let handle = thread::Builder::new()
            .name("echoloop-audio".into())
            .spawn(move || {
                run_worker(
                    capture,
                    sink,
                    processor,
                    controls,
                    diagnostics,
                    worker_stop,
                    frame_size,
                )
            })?;

        info!(
            "Processing loop started at {} with {}-sample frames, echo cancellation {}",
            rate,
            frame_size.len(),
            if settings.echo_cancellation { "on" } else { "off" }
        );
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn align_controller(&self, rate: SampleRate) -> Result<(), PipelineError> {
        let mut controller = lock_controller(&self.controller)?;
        let setup = if controller.config().sample_rate != rate {
            controller.set_sample_rate(Some(rate))
        } else if !controller.is_prepared() {
            controller.prepare()
        } else {
            Ok(())
        };
        if let Err(e) = setup {
            warn!("Starting without a prepared engine: {}", e);
        }
        Ok(())
    }

    /// Asks the worker to exit after its current iteration. Does not wait.
    pub fn signal_stop(&self) {
        if let Some(worker) = &self.worker {
            worker.stop.store(true, Ordering::Release);
        }
    }

    /// Stops the worker, waits for it, then shuts both devices down.
    pub fn stop(&mut self) -> Result<LoopStats, PipelineError> {
        let worker = self.worker.take().ok_or(PipelineError::NotRunning)?;
        worker.stop.store(true, Ordering::Release);
        let WorkerExit {
            stats,
            mut capture,
            mut sink,
        } = worker
            .handle
            .join()
            .map_err(|_| PipelineError::WorkerPanicked)?;

        capture.stop();
        capture.release();
        sink.flush();
        sink.stop();

        info!(
            "Processing loop stopped after {} frames ({} cancelled, {} passed through)",
            stats.frames, stats.cancelled, stats.passed_through
        );
        Ok(stats)
    }
}

impl<E: EchoEngine + 'static> Drop for ProcessingLoop<E> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                warn!("Processing loop did not stop cleanly: {}", e);
            }
        }
    }
}

fn run_worker<E: EchoEngine>(
    mut capture: Box<dyn CaptureSource>,
    mut sink: Box<dyn PlaybackSink>,
    processor: FrameProcessor<E>,
    controls: LoopControls,
    diagnostics: Diagnostics,
    stop: Arc<AtomicBool>,
    frame_size: FrameSize,
) -> WorkerExit {
    let mut stats = LoopStats::default();
    let mut frame = vec![0i16; frame_size.len()];
    let mut passing_through = false;

    while !stop.load(Ordering::Acquire) {
        match capture.read_frame(&mut frame) {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                stats.read_timeouts += 1;
                continue;
            }
            Err(e) => {
                diagnostics.emit(Diagnostic::DeviceFailed {
                    device: "capture",
                    reason: e.to_string(),
                });
                stats.device_error = Some(e);
                break;
            }
        }

        let outcome = processor.process(&frame, controls.echo_cancellation(), controls.delay_ms());
        let written = match &outcome {
            FrameOutcome::Cancelled(out) => {
                stats.cancelled += 1;
                passing_through = false;
                sink.write_frame(out.samples())
            }
            FrameOutcome::PassThrough(reason) => {
                stats.passed_through += 1;
                if !passing_through {
                    passing_through = true;
                    diagnostics.emit(Diagnostic::PassThrough {
                        reason: reason.clone(),
                    });
                }
                sink.write_frame(&frame)
            }
        };
        stats.frames += 1;

        match written {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => stats.write_timeouts += 1,
            Err(e) => {
                diagnostics.emit(Diagnostic::DeviceFailed {
                    device: "playback",
                    reason: e.to_string(),
                });
                stats.device_error = Some(e);
                break;
            }
        }
    }

    debug!("Audio worker exiting");
    WorkerExit {
        stats,
        capture,
        sink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::EchoController;
    use crate::testing::{CollectingSink, RecordingEngine, ScriptedCapture};
    use std::time::Duration;

    #[test]
    fn test_controls_raise_delay_to_minimum() {
        let controls = LoopControls::default();
        controls.set_delay_ms(0);
        assert_eq!(controls.delay_ms(), MIN_DELAY_MS);
        controls.set_delay_ms(45);
        assert_eq!(controls.delay_ms(), 45);
    }

    #[test]
    fn test_settings_default_to_rate_block() {
        let settings = LoopSettings::new(SampleRate::Hz8000);
        assert_eq!(settings.frame_size, FrameSize::Samples80);
        assert!(!settings.echo_cancellation);
    }

    #[test]
    fn test_stop_without_start_fails() {
        let controller = EchoController::new(RecordingEngine::new()).into_shared();
        let mut pipeline = ProcessingLoop::new(controller);
        assert!(matches!(pipeline.stop(), Err(PipelineError::NotRunning)));
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_start_aligns_sample_rate() {
        let controller = EchoController::new(RecordingEngine::new()).into_shared();
        let mut pipeline = ProcessingLoop::new(Arc::clone(&controller));
        pipeline
            .start(
                LoopSettings::new(SampleRate::Hz8000),
                Box::new(ScriptedCapture::from_frames(vec![])),
                Box::new(CollectingSink::new()),
            )
            .unwrap();
        {
            let guard = controller.lock().unwrap();
            assert_eq!(guard.config().sample_rate, SampleRate::Hz8000);
            assert!(guard.is_prepared());
        }
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_live_toggle_switches_to_cancellation() {
        let controller = EchoController::new(RecordingEngine::new()).into_shared();
        let mut pipeline = ProcessingLoop::new(controller);
        let sink = CollectingSink::new();
        let tap = sink.tap();
        pipeline
            .start(
                LoopSettings::new(SampleRate::Hz16000),
                Box::new(ScriptedCapture::counting().paced(Duration::from_millis(2))),
                Box::new(sink),
            )
            .unwrap();

        assert!(tap.wait_for(3, Duration::from_secs(2)));
        pipeline.controls().set_echo_cancellation(true);
        let seen = tap.len();
        assert!(tap.wait_for(seen + 3, Duration::from_secs(2)));

        let stats = pipeline.stop().unwrap();
        assert!(stats.passed_through > 0);
        assert!(stats.cancelled > 0);
        assert_eq!(stats.frames, stats.cancelled + stats.passed_through);
    }
}
