pub mod config;
pub mod constants;
pub mod controller;
pub mod device;
pub mod diagnostics;
pub mod echo_cancel;
pub mod engine;
pub mod error;
pub mod frame;
pub mod frame_adapter;
pub mod pipeline;
pub mod processor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{AggressiveMode, EngineConfig, SampleRate};
pub use controller::{EchoController, LifecycleState, SharedController};
pub use device::{CaptureSource, PlaybackSink};
pub use diagnostics::{Diagnostic, Diagnostics};
pub use echo_cancel::Aec3Engine;
pub use engine::{EchoEngine, EngineHandle};
pub use error::{DeviceError, EngineError, PipelineError};
pub use frame::{Frame, FrameSize};
pub use frame_adapter::FrameAdapter;
pub use pipeline::{LoopControls, LoopSettings, LoopStats, ProcessingLoop};
pub use processor::{FrameOutcome, FrameProcessor};
