use echoloop_core::testing::{CollectingSink, EngineCall, RecordingEngine, ScriptedCapture};
use echoloop_core::{
    Diagnostic, Diagnostics, EchoController, EngineConfig, FrameSize, LoopSettings,
    PipelineError, ProcessingLoop, SampleRate, SharedController,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn controller_with(
    engine: RecordingEngine,
    diagnostics: Diagnostics,
) -> SharedController<RecordingEngine> {
    EchoController::with_diagnostics(engine, EngineConfig::default(), diagnostics).into_shared()
}

fn ramp_frames(count: usize, len: usize) -> Vec<Vec<i16>> {
    (0..count)
        .map(|n| (0..len).map(|i| (n * 100 + i) as i16).collect())
        .collect()
}

#[test]
fn test_disabled_loop_forwards_frames_unmodified() {
    init_logging();
    let engine = RecordingEngine::new();
    let log = engine.log();
    let controller = EchoController::new(engine).into_shared();
    let mut pipeline = ProcessingLoop::new(controller);

    let frames = ramp_frames(50, 80);
    let sink = CollectingSink::new();
    let tap = sink.tap();
    pipeline
        .start(
            LoopSettings::new(SampleRate::Hz8000).with_frame_size(FrameSize::Samples80),
            Box::new(ScriptedCapture::from_frames(frames.clone())),
            Box::new(sink),
        )
        .unwrap();

    assert!(tap.wait_for(frames.len(), Duration::from_secs(5)));
    let stats = pipeline.stop().unwrap();

    assert_eq!(tap.frames(), frames);
    assert_eq!(stats.frames, 50);
    assert_eq!(stats.passed_through, 50);
    assert_eq!(stats.cancelled, 0);
    assert!(!log.calls().iter().any(|c| matches!(
        c,
        EngineCall::BufferFarend { .. } | EngineCall::Process { .. }
    )));
}

#[test]
fn test_enabled_loop_buffers_farend_before_each_cancel() {
    init_logging();
    let engine = RecordingEngine::new();
    let log = engine.log();
    let controller = EchoController::new(engine).into_shared();
    let mut pipeline = ProcessingLoop::new(controller);

    let period = FrameSize::Samples160.duration_at(SampleRate::Hz16000);
    let sink = CollectingSink::new();
    let tap = sink.tap();
    pipeline
        .start(
            LoopSettings::new(SampleRate::Hz16000).with_echo_cancellation(true),
            Box::new(ScriptedCapture::counting().paced(period)),
            Box::new(sink),
        )
        .unwrap();

    assert!(tap.wait_for(110, Duration::from_secs(10)));

    pipeline.signal_stop();
    let signalled = Instant::now();
    let at_signal = tap.len();
    let stats = pipeline.stop().unwrap();
    let elapsed = signalled.elapsed();

    assert!(tap.len() <= at_signal + 1);
    // At most the in-flight read (one frame period) plus scheduling slack.
    assert!(elapsed <= period * 2, "stop took {:?}", elapsed);
    assert_eq!(stats.passed_through, 0);

    let processing: Vec<_> = log
        .calls()
        .into_iter()
        .skip_while(|c| !matches!(c, EngineCall::BufferFarend { .. }))
        .collect();
    assert!(processing.len() >= 200);
    assert_eq!(processing.len() % 2, 0);
    for (n, pair) in processing.chunks(2).enumerate() {
        match pair {
            [EngineCall::BufferFarend {
                first: far,
                len: 160,
                ..
            }, EngineCall::Process {
                first: near,
                len: 160,
                ..
            }] => {
                assert_eq!(*far, n as i16);
                assert_eq!(*near, n as i16);
            }
            other => panic!("iteration {} out of order: {:?}", n, other),
        }
    }
}

#[test]
fn test_second_start_is_rejected() {
    init_logging();
    let controller = EchoController::new(RecordingEngine::new()).into_shared();
    let mut pipeline = ProcessingLoop::new(controller);
    pipeline
        .start(
            LoopSettings::default(),
            Box::new(ScriptedCapture::counting().paced(Duration::from_millis(5))),
            Box::new(CollectingSink::new()),
        )
        .unwrap();

    let second = CollectingSink::new();
    let probe = second.probe();
    let result = pipeline.start(
        LoopSettings::default(),
        Box::new(ScriptedCapture::counting()),
        Box::new(second),
    );

    assert!(matches!(result, Err(PipelineError::AlreadyRunning)));
    assert_eq!(probe.opens(), 0);
    assert!(pipeline.is_running());
    pipeline.stop().unwrap();
    assert!(!pipeline.is_running());
}

#[test]
fn test_stop_shuts_devices_down() {
    init_logging();
    let controller = EchoController::new(RecordingEngine::new()).into_shared();
    let mut pipeline = ProcessingLoop::new(controller);
    let capture = ScriptedCapture::counting().paced(Duration::from_millis(2));
    let capture_probe = capture.probe();
    let sink = CollectingSink::new();
    let sink_probe = sink.probe();

    pipeline
        .start(LoopSettings::default(), Box::new(capture), Box::new(sink))
        .unwrap();
    pipeline.stop().unwrap();

    assert!(capture_probe.stopped());
    assert!(capture_probe.released());
    assert!(sink_probe.stopped());
    assert!(sink_probe.flushed());
    assert_eq!(capture_probe.rate(), Some(SampleRate::Hz16000));
}

#[test]
fn test_transient_open_failures_are_retried() {
    init_logging();
    let (diagnostics, rx) = Diagnostics::channel_default();
    let controller = controller_with(RecordingEngine::new(), diagnostics);
    let mut pipeline = ProcessingLoop::new(controller);
    let capture = ScriptedCapture::counting().failing_opens(2);
    let probe = capture.probe();

    pipeline
        .start(
            LoopSettings::default(),
            Box::new(capture),
            Box::new(CollectingSink::new()),
        )
        .unwrap();
    pipeline.stop().unwrap();

    assert_eq!(probe.opens(), 3);
    let retries = rx
        .try_iter()
        .filter(|e| matches!(e, Diagnostic::DeviceRetry { device: "capture", .. }))
        .count();
    assert_eq!(retries, 2);
}

#[test]
fn test_unavailable_playback_releases_capture() {
    init_logging();
    let (diagnostics, rx) = Diagnostics::channel_default();
    let controller = controller_with(RecordingEngine::new(), diagnostics);
    let mut pipeline = ProcessingLoop::new(controller);
    let capture = ScriptedCapture::counting();
    let capture_probe = capture.probe();

    let result = pipeline.start(
        LoopSettings::default(),
        Box::new(capture),
        Box::new(CollectingSink::new().failing_opens(10)),
    );

    assert!(matches!(
        result,
        Err(PipelineError::DeviceUnavailable { device: "playback", attempts: 3, .. })
    ));
    assert!(capture_probe.released());
    assert!(!pipeline.is_running());
    let failures = rx
        .try_iter()
        .filter(|e| matches!(e, Diagnostic::DeviceFailed { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[test]
fn test_failed_prepare_passes_audio_through() {
    init_logging();
    let (diagnostics, rx) = Diagnostics::channel_default();
    let controller = controller_with(RecordingEngine::new().failing_initialize(), diagnostics);
    let mut pipeline = ProcessingLoop::new(Arc::clone(&controller));

    let frames = ramp_frames(10, 160);
    let sink = CollectingSink::new();
    let tap = sink.tap();
    pipeline
        .start(
            LoopSettings::default().with_echo_cancellation(true),
            Box::new(ScriptedCapture::from_frames(frames.clone())),
            Box::new(sink),
        )
        .unwrap();
    assert!(tap.wait_for(frames.len(), Duration::from_secs(5)));
    let stats = pipeline.stop().unwrap();

    assert_eq!(tap.frames(), frames);
    assert_eq!(stats.passed_through, 10);
    let events: Vec<_> = rx.try_iter().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, Diagnostic::PrepareFailed { .. })));
    let pass_through = events
        .iter()
        .filter(|e| matches!(e, Diagnostic::PassThrough { .. }))
        .count();
    assert_eq!(pass_through, 1);
}

#[test]
fn test_capture_failure_ends_loop() {
    init_logging();
    let (diagnostics, rx) = Diagnostics::channel_default();
    let controller = controller_with(RecordingEngine::new(), diagnostics);
    let mut pipeline = ProcessingLoop::new(controller);

    // An 80-sample frame in a 160-sample loop is a hard device error.
    let capture = ScriptedCapture::from_frames(vec![vec![0; 160], vec![0; 80]]);
    pipeline
        .start(LoopSettings::default(), Box::new(capture), Box::new(CollectingSink::new()))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!pipeline.is_running());

    let stats = pipeline.stop().unwrap();
    assert_eq!(stats.frames, 1);
    assert!(stats.device_error.is_some());
    assert!(rx
        .try_iter()
        .any(|e| matches!(e, Diagnostic::DeviceFailed { device: "capture", .. })));
}
