//! One iteration of the capture -> cancel -> playback pump.

use crate::controller::{lock_controller, SharedController};
use crate::engine::EchoEngine;
use crate::frame::Frame;

/// Result of running one captured frame through the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Cancelled(Frame),
    /// The raw frame should be played; the reason says why
    PassThrough(String),
}

impl FrameOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FrameOutcome::Cancelled(_))
    }
}

pub struct FrameProcessor<E: EchoEngine> {
    controller: SharedController<E>,
}

impl<E: EchoEngine> FrameProcessor<E> {
    pub fn new(controller: SharedController<E>) -> Self {
        Self { controller }
    }

    /// Feeds `frame` as far-end reference and then cancels it as near-end.
    ///
    /// Both calls happen under a single lock so no reconfiguration can land
    /// between buffering a frame and consuming it.
    pub fn process(&self, frame: &[i16], enabled: bool, delay_ms: i32) -> FrameOutcome {
        if !enabled {
            return FrameOutcome::PassThrough("echo cancellation disabled".into());
        }

        let mut controller = match lock_controller(&self.controller) {
            Ok(guard) => guard,
            Err(e) => return FrameOutcome::PassThrough(e.to_string()),
        };
        let cancelled = controller
            .farend(frame)
            .and_then(|()| controller.cancel_echo(frame, frame.len() as i32, delay_ms));
        match cancelled {
            Ok(out) => FrameOutcome::Cancelled(out),
            Err(e) => FrameOutcome::PassThrough(e.to_string()),
        }
    }
}
