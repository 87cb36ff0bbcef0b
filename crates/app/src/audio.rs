//! cpal-backed capture source and playback sink.
//!
//! A `cpal::Stream` cannot leave the thread that built it, so each open
//! device gets a holder thread that builds the stream, plays it and drops it
//! on shutdown. Samples cross between the cpal callback and the processing
//! loop through a lock-free ring buffer.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use echoloop_core::frame::{f32_to_i16, i16_to_f32};
use echoloop_core::{CaptureSource, DeviceError, PlaybackSink, SampleRate};
use log::{debug, info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a stream may take to build and start
const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest a read or write waits for the device before timing out
const IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll interval while waiting on the ring buffer
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Ring buffer length in milliseconds of audio
const BUFFER_MS: usize = 100;

fn stream_config(rate: SampleRate) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(rate.hz()),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn find_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, String> {
    if name == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| "No default input found".to_string());
    }
    host.input_devices()
        .map_err(|e| e.to_string())?
        .find(|d| d.name().ok().as_deref() == Some(name))
        .ok_or_else(|| "Input device not found".to_string())
}

fn find_output_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, String> {
    if name == "default" {
        return host
            .default_output_device()
            .ok_or_else(|| "No default output found".to_string());
    }
    host.output_devices()
        .map_err(|e| e.to_string())?
        .find(|d| d.name().ok().as_deref() == Some(name))
        .ok_or_else(|| "Output device not found".to_string())
}

/// Owns one running cpal stream on a dedicated thread.
struct StreamHolder {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHolder {
    fn spawn<F>(thread_name: &str, device: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
    {
        let open_error = |reason: String| DeviceError::Open {
            device: device.to_string(),
            reason,
        };
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let (shutdown_tx, shutdown_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);

        let thread = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || {
                let stream = match build()
                    .and_then(|s| s.play().map(|()| s).map_err(|e| e.to_string()))
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on an explicit shutdown or when the sender is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| open_error(e.to_string()))?;

        let mut holder = Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };
        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(holder),
            Ok(Err(reason)) => {
                holder.shutdown();
                Err(open_error(reason))
            }
            Err(RecvTimeoutError::Timeout) => {
                // The stuck thread is left behind; dropping the sender lets it
                // exit if the build ever returns.
                holder.shutdown.take();
                holder.thread.take();
                Err(open_error(format!("stream did not start within {:?}", OPEN_TIMEOUT)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                holder.shutdown();
                Err(open_error("stream thread exited".into()))
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamHolder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Microphone capture through cpal.
pub struct CpalCapture {
    device: String,
    read_timeout: Duration,
    consumer: Option<HeapCons<i16>>,
    holder: Option<StreamHolder>,
    failed: Arc<AtomicBool>,
}

impl CpalCapture {
    /// `device` is a device name or `"default"`.
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            read_timeout: IO_TIMEOUT,
            consumer: None,
            holder: None,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CaptureSource for CpalCapture {
    fn open(&mut self, rate: SampleRate) -> Result<(), DeviceError> {
        self.release();
        self.failed.store(false, Ordering::Relaxed);

        let rb = HeapRb::<i16>::new(rate.samples_per_ms() * BUFFER_MS);
        let (mut producer, consumer) = rb.split();
        let name = self.device.clone();
        let failed = Arc::clone(&self.failed);

        let holder = StreamHolder::spawn("echoloop-capture", &self.device, move || {
            let host = cpal::default_host();
            let device = find_input_device(&host, &name)?;
            info!(
                "Using input device: {}",
                device.name().unwrap_or_default()
            );
            device
                .build_input_stream(
                    &stream_config(rate),
                    move |data: &[f32], _| {
                        for &sample in data {
                            if producer.try_push(f32_to_i16(sample)).is_err() {
                                // Loop is behind; newest samples are dropped.
                                break;
                            }
                        }
                    },
                    move |err| {
                        warn!("Input error: {}", err);
                        failed.store(true, Ordering::Relaxed);
                    },
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        self.consumer = Some(consumer);
        self.holder = Some(holder);
        Ok(())
    }

    fn read_frame(&mut self, frame: &mut [i16]) -> Result<(), DeviceError> {
        let consumer = self.consumer.as_mut().ok_or_else(|| DeviceError::NotOpen {
            device: self.device.clone(),
        })?;
        let deadline = Instant::now() + self.read_timeout;
        loop {
            if self.failed.load(Ordering::Relaxed) {
                return Err(DeviceError::Stream {
                    device: self.device.clone(),
                    reason: "input stream reported an error".into(),
                });
            }
            if consumer.occupied_len() >= frame.len() {
                consumer.pop_slice(frame);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    device: self.device.clone(),
                    after: self.read_timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&mut self) {
        if let Some(mut holder) = self.holder.take() {
            holder.shutdown();
            debug!("Input stream on {} stopped", self.device);
        }
    }

    fn release(&mut self) {
        self.stop();
        self.consumer = None;
    }
}

/// Speaker playback through cpal.
pub struct CpalPlayback {
    device: String,
    write_timeout: Duration,
    producer: Option<HeapProd<i16>>,
    holder: Option<StreamHolder>,
    flush_requested: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl CpalPlayback {
    /// `device` is a device name or `"default"`.
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            write_timeout: IO_TIMEOUT,
            producer: None,
            holder: None,
            flush_requested: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PlaybackSink for CpalPlayback {
    fn open(&mut self, rate: SampleRate) -> Result<(), DeviceError> {
        self.stop();
        self.failed.store(false, Ordering::Relaxed);
        self.flush_requested.store(false, Ordering::Relaxed);

        let rb = HeapRb::<i16>::new(rate.samples_per_ms() * BUFFER_MS);
        let (producer, mut consumer) = rb.split();
        let name = self.device.clone();
        let failed = Arc::clone(&self.failed);
        let flush = Arc::clone(&self.flush_requested);

        let holder = StreamHolder::spawn("echoloop-playback", &self.device, move || {
            let host = cpal::default_host();
            let device = find_output_device(&host, &name)?;
            info!(
                "Using output device: {}",
                device.name().unwrap_or_default()
            );
            device
                .build_output_stream(
                    &stream_config(rate),
                    move |data: &mut [f32], _| {
                        if flush.swap(false, Ordering::Relaxed) {
                            consumer.clear();
                        }
                        for sample in data.iter_mut() {
                            *sample = consumer.try_pop().map(i16_to_f32).unwrap_or(0.0);
                        }
                    },
                    move |err| {
                        warn!("Output error: {}", err);
                        failed.store(true, Ordering::Relaxed);
                    },
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        self.producer = Some(producer);
        self.holder = Some(holder);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[i16]) -> Result<(), DeviceError> {
        let producer = self.producer.as_mut().ok_or_else(|| DeviceError::NotOpen {
            device: self.device.clone(),
        })?;
        let deadline = Instant::now() + self.write_timeout;
        loop {
            if self.failed.load(Ordering::Relaxed) {
                return Err(DeviceError::Stream {
                    device: self.device.clone(),
                    reason: "output stream reported an error".into(),
                });
            }
            if producer.vacant_len() >= frame.len() {
                producer.push_slice(frame);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    device: self.device.clone(),
                    after: self.write_timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&mut self) {
        if let Some(mut holder) = self.holder.take() {
            holder.shutdown();
            debug!("Output stream on {} stopped", self.device);
        }
        self.producer = None;
    }

    fn flush(&mut self) {
        self.flush_requested.store(true, Ordering::Relaxed);
    }
}

pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopened_capture_reports_not_open() {
        let mut capture = CpalCapture::new("default");
        let mut frame = [0i16; 160];
        assert!(matches!(
            capture.read_frame(&mut frame),
            Err(DeviceError::NotOpen { .. })
        ));
    }

    #[test]
    fn test_unopened_playback_reports_not_open() {
        let mut playback = CpalPlayback::new("default");
        assert!(matches!(
            playback.write_frame(&[0; 80]),
            Err(DeviceError::NotOpen { .. })
        ));
        // stop and flush before open are harmless
        playback.flush();
        playback.stop();
    }

    #[test]
    fn test_stream_config_is_mono() {
        let config = stream_config(SampleRate::Hz8000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_rate, cpal::SampleRate(8000));
    }
}
