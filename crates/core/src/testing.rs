//! In-memory engine and devices for exercising the controller and the loop
//! without native code or audio hardware.

use crate::config::{EngineConfig, SampleRate};
use crate::device::{CaptureSource, PlaybackSink};
use crate::engine::{EchoEngine, EngineHandle};
use crate::error::{DeviceError, EngineError};
use crate::frame::{validate_len, Frame};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One call made against a [`RecordingEngine`].
///
/// Frames are identified by their first sample, which the scripted capture
/// sets to the frame's sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create(EngineHandle),
    Initialize(EngineHandle, SampleRate),
    SetConfig(EngineHandle, EngineConfig),
    BufferFarend {
        handle: EngineHandle,
        len: usize,
        first: i16,
    },
    Process {
        handle: EngineHandle,
        len: usize,
        first: i16,
        clean: bool,
        num_samples: i16,
        delay_ms: i16,
    },
    Free(EngineHandle),
}

/// Shared view of the calls a [`RecordingEngine`] has received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<EngineCall>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.0).clone()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }

    fn push(&self, call: EngineCall) {
        lock(&self.0).push(call);
    }
}

/// Engine that validates the contract and echoes the near-end back.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    log: CallLog,
    next_handle: i64,
    /// Live handles and the rate each is bound to
    live: HashMap<EngineHandle, Option<SampleRate>>,
    fail_create: bool,
    fail_initialize: bool,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create()` returns the invalid sentinel.
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Every `initialize()` fails.
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn live_instances(&self) -> usize {
        self.live.len()
    }

    fn initialized(&self, handle: EngineHandle) -> Result<(), EngineError> {
        match self.live.get(&handle) {
            None => Err(EngineError::InvalidHandle {
                handle: handle.raw(),
            }),
            Some(None) => Err(EngineError::NotInitialized {
                handle: handle.raw(),
            }),
            Some(Some(_)) => Ok(()),
        }
    }
}

impl EchoEngine for RecordingEngine {
    fn create(&mut self) -> EngineHandle {
        if self.fail_create {
            self.log.push(EngineCall::Create(EngineHandle::INVALID));
            return EngineHandle::INVALID;
        }
        let handle = EngineHandle::from_raw(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle, None);
        self.log.push(EngineCall::Create(handle));
        handle
    }

    fn initialize(&mut self, handle: EngineHandle, rate: SampleRate) -> Result<(), EngineError> {
        self.log.push(EngineCall::Initialize(handle, rate));
        if self.fail_initialize {
            return Err(EngineError::InitFailed {
                rate,
                reason: "scripted failure".into(),
            });
        }
        let slot = self.live.get_mut(&handle).ok_or(EngineError::InvalidHandle {
            handle: handle.raw(),
        })?;
        *slot = Some(rate);
        Ok(())
    }

    fn set_config(
        &mut self,
        handle: EngineHandle,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        self.log.push(EngineCall::SetConfig(handle, *config));
        self.initialized(handle)
    }

    fn buffer_farend(&mut self, handle: EngineHandle, farend: &[i16]) -> Result<(), EngineError> {
        self.log.push(EngineCall::BufferFarend {
            handle,
            len: farend.len(),
            first: farend.first().copied().unwrap_or_default(),
        });
        self.initialized(handle)?;
        validate_len(farend)?;
        Ok(())
    }

    fn process(
        &mut self,
        handle: EngineHandle,
        nearend_noisy: &[i16],
        nearend_clean: Option<&[i16]>,
        num_samples: i16,
        delay_ms: i16,
    ) -> Result<Frame, EngineError> {
        self.log.push(EngineCall::Process {
            handle,
            len: nearend_noisy.len(),
            first: nearend_noisy.first().copied().unwrap_or_default(),
            clean: nearend_clean.is_some(),
            num_samples,
            delay_ms,
        });
        self.initialized(handle)?;
        Frame::new(nearend_noisy.to_vec())
    }

    fn free(&mut self, handle: EngineHandle) -> Result<(), EngineError> {
        self.log.push(EngineCall::Free(handle));
        self.live
            .remove(&handle)
            .map(|_| ())
            .ok_or(EngineError::InvalidHandle {
                handle: handle.raw(),
            })
    }
}

/// Lifecycle flags of a memory device, observable after it moved into a loop.
#[derive(Debug, Default)]
pub struct DeviceProbe {
    opens: AtomicU32,
    failed_opens: AtomicU32,
    stopped: AtomicBool,
    released: AtomicBool,
    flushed: AtomicBool,
    rate: Mutex<Option<SampleRate>>,
}

impl DeviceProbe {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn failed_opens(&self) -> u32 {
        self.failed_opens.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    pub fn rate(&self) -> Option<SampleRate> {
        *lock(&self.rate)
    }

    /// Counts an open attempt; fails while scripted failures remain.
    fn open(&self, device: &str, rate: SampleRate, failures: &mut u32) -> Result<(), DeviceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if *failures > 0 {
            *failures -= 1;
            self.failed_opens.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Open {
                device: device.to_string(),
                reason: "scripted failure".into(),
            });
        }
        *lock(&self.rate) = Some(rate);
        Ok(())
    }
}

enum Script {
    Frames(VecDeque<Vec<i16>>),
    /// Endless frames filled with their sequence number
    Counting { next: u64 },
}

/// Capture source replaying scripted frames.
///
/// Once a finite script is exhausted, reads time out like an idle microphone.
pub struct ScriptedCapture {
    script: Script,
    frame_period: Option<Duration>,
    next_deadline: Option<Instant>,
    idle_timeout: Duration,
    open_failures: u32,
    is_open: bool,
    probe: Arc<DeviceProbe>,
}

impl ScriptedCapture {
    const NAME: &'static str = "scripted capture";

    pub fn from_frames(frames: Vec<Vec<i16>>) -> Self {
        Self::with_script(Script::Frames(frames.into()))
    }

    /// Endless source where frame `n` is filled with `n` (wrapping at i16::MAX).
    pub fn counting() -> Self {
        Self::with_script(Script::Counting { next: 0 })
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            frame_period: None,
            next_deadline: None,
            idle_timeout: Duration::from_millis(2),
            open_failures: 0,
            is_open: false,
            probe: Arc::new(DeviceProbe::default()),
        }
    }

    /// Delivers frames no faster than one per `period`, like a real device.
    pub fn paced(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }

    /// The first `count` calls to `open` fail.
    pub fn failing_opens(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    pub fn probe(&self) -> Arc<DeviceProbe> {
        Arc::clone(&self.probe)
    }

    fn wait_for_cadence(&mut self) {
        let Some(period) = self.frame_period else {
            return;
        };
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + period);
    }
}

impl CaptureSource for ScriptedCapture {
    fn open(&mut self, rate: SampleRate) -> Result<(), DeviceError> {
        self.probe.open(Self::NAME, rate, &mut self.open_failures)?;
        self.is_open = true;
        Ok(())
    }

    fn read_frame(&mut self, frame: &mut [i16]) -> Result<(), DeviceError> {
        if !self.is_open {
            return Err(DeviceError::NotOpen {
                device: Self::NAME.into(),
            });
        }
        self.wait_for_cadence();
        match &mut self.script {
            Script::Counting { next } => {
                frame.fill((*next % i16::MAX as u64) as i16);
                *next += 1;
                Ok(())
            }
            Script::Frames(frames) => match frames.pop_front() {
                Some(samples) if samples.len() == frame.len() => {
                    frame.copy_from_slice(&samples);
                    Ok(())
                }
                Some(samples) => Err(DeviceError::FrameSize {
                    device: Self::NAME.into(),
                    expected: frame.len(),
                    actual: samples.len(),
                }),
                None => {
                    thread::sleep(self.idle_timeout);
                    Err(DeviceError::Timeout {
                        device: Self::NAME.into(),
                        after: self.idle_timeout,
                    })
                }
            },
        }
    }

    fn stop(&mut self) {
        self.probe.stopped.store(true, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.is_open = false;
        self.probe.released.store(true, Ordering::SeqCst);
    }
}

/// Shared view of the frames a [`CollectingSink`] received, in order.
#[derive(Debug, Clone, Default)]
pub struct SinkTap(Arc<Mutex<Vec<Vec<i16>>>>);

impl SinkTap {
    pub fn frames(&self) -> Vec<Vec<i16>> {
        lock(&self.0).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Polls until at least `count` frames arrived or `timeout` elapsed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.len() >= count
    }
}

/// Playback sink that records every frame written to it.
pub struct CollectingSink {
    tap: SinkTap,
    open_failures: u32,
    is_open: bool,
    probe: Arc<DeviceProbe>,
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectingSink {
    const NAME: &'static str = "collecting sink";

    pub fn new() -> Self {
        Self {
            tap: SinkTap::default(),
            open_failures: 0,
            is_open: false,
            probe: Arc::new(DeviceProbe::default()),
        }
    }

    pub fn failing_opens(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    pub fn tap(&self) -> SinkTap {
        self.tap.clone()
    }

    pub fn probe(&self) -> Arc<DeviceProbe> {
        Arc::clone(&self.probe)
    }
}

impl PlaybackSink for CollectingSink {
    fn open(&mut self, rate: SampleRate) -> Result<(), DeviceError> {
        self.probe.open(Self::NAME, rate, &mut self.open_failures)?;
        self.is_open = true;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[i16]) -> Result<(), DeviceError> {
        if !self.is_open {
            return Err(DeviceError::NotOpen {
                device: Self::NAME.into(),
            });
        }
        lock(&self.tap.0).push(frame.to_vec());
        Ok(())
    }

    fn stop(&mut self) {
        self.is_open = false;
        self.probe.stopped.store(true, Ordering::SeqCst);
    }

    fn flush(&mut self) {
        self.probe.flushed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_capture_numbers_frames() {
        let mut capture = ScriptedCapture::counting();
        capture.open(SampleRate::Hz16000).unwrap();
        let mut frame = [0i16; 160];
        for expected in 0..3 {
            capture.read_frame(&mut frame).unwrap();
            assert!(frame.iter().all(|&s| s == expected));
        }
    }

    #[test]
    fn test_exhausted_script_times_out() {
        let mut capture = ScriptedCapture::from_frames(vec![vec![1; 80]]);
        capture.open(SampleRate::Hz8000).unwrap();
        let mut frame = [0i16; 80];
        assert!(capture.read_frame(&mut frame).is_ok());
        let err = capture.read_frame(&mut frame).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_read_before_open_fails() {
        let mut capture = ScriptedCapture::counting();
        let mut frame = [0i16; 80];
        assert!(matches!(
            capture.read_frame(&mut frame),
            Err(DeviceError::NotOpen { .. })
        ));
    }

    #[test]
    fn test_sink_records_in_order() {
        let mut sink = CollectingSink::new();
        let tap = sink.tap();
        sink.open(SampleRate::Hz8000).unwrap();
        sink.write_frame(&[1; 80]).unwrap();
        sink.write_frame(&[2; 80]).unwrap();
        assert_eq!(tap.frames(), vec![vec![1; 80], vec![2; 80]]);
    }

    #[test]
    fn test_scripted_open_failures() {
        let mut sink = CollectingSink::new().failing_opens(1);
        let probe = sink.probe();
        assert!(sink.open(SampleRate::Hz16000).is_err());
        assert!(sink.open(SampleRate::Hz16000).is_ok());
        assert_eq!(probe.opens(), 2);
        assert_eq!(probe.failed_opens(), 1);
        assert_eq!(probe.rate(), Some(SampleRate::Hz16000));
    }
}
