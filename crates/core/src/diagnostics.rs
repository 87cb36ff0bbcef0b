//! Diagnostic events raised by the controller and the processing loop.
//!
//! Every event is logged; when a channel is attached it is also forwarded
//! without blocking so a control surface can react to it.

use crate::constants::DIAGNOSTICS_CAPACITY;
use crate::controller::LifecycleState;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An absent or unrecognised setting was replaced by its default
    InputDefaulted {
        setting: &'static str,
        fallback: String,
    },
    /// A value was pinned to the range the engine accepts
    Clamped {
        parameter: &'static str,
        requested: i64,
        applied: i64,
    },
    /// A processing call arrived outside the prepared state
    SequencingViolation {
        operation: &'static str,
        state: LifecycleState,
    },
    PrepareFailed {
        reason: String,
    },
    /// The loop started forwarding raw capture audio
    PassThrough {
        reason: String,
    },
    DeviceRetry {
        device: &'static str,
        attempt: u32,
        reason: String,
    },
    DeviceFailed {
        device: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    tx: Option<Sender<Diagnostic>>,
}

impl Diagnostics {
    /// Log-only emitter.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel(capacity: usize) -> (Self, Receiver<Diagnostic>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn channel_default() -> (Self, Receiver<Diagnostic>) {
        Self::channel(DIAGNOSTICS_CAPACITY)
    }

    pub fn emit(&self, event: Diagnostic) {
        match &event {
            Diagnostic::InputDefaulted { setting, fallback } => {
                info!("{} not set or invalid, using {}", setting, fallback)
            }
            Diagnostic::Clamped {
                parameter,
                requested,
                applied,
            } => warn!(
                "{} = {} outside 16-bit range, using {}",
                parameter, requested, applied
            ),
            Diagnostic::SequencingViolation { operation, state } => {
                warn!("{} called on an unprepared engine ({:?})", operation, state)
            }
            Diagnostic::PrepareFailed { reason } => warn!("Engine prepare failed: {}", reason),
            Diagnostic::PassThrough { reason } => warn!("Passing raw audio through: {}", reason),
            Diagnostic::DeviceRetry {
                device,
                attempt,
                reason,
            } => warn!("Opening {} failed (attempt {}): {}", device, attempt, reason),
            Diagnostic::DeviceFailed { device, reason } => {
                error!("{} unavailable: {}", device, reason)
            }
        }

        if let Some(tx) = &self.tx {
            match tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(dropped)) => {
                    log::debug!("Diagnostics channel full, dropped {:?}", dropped)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_channel() {
        let (diagnostics, rx) = Diagnostics::channel(4);
        diagnostics.emit(Diagnostic::PrepareFailed {
            reason: "no memory".into(),
        });
        assert_eq!(
            rx.try_recv(),
            Ok(Diagnostic::PrepareFailed {
                reason: "no memory".into()
            })
        );
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (diagnostics, rx) = Diagnostics::channel(1);
        for attempt in 1..=3 {
            diagnostics.emit(Diagnostic::DeviceRetry {
                device: "capture",
                attempt,
                reason: "busy".into(),
            });
        }
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_disconnected_channel_is_ignored() {
        let (diagnostics, rx) = Diagnostics::channel(1);
        drop(rx);
        diagnostics.emit(Diagnostic::PassThrough {
            reason: "disabled".into(),
        });
    }
}
