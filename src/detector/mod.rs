//! Foreground app detection.
//!
//! Two detectors feed the same channel: an event-driven one fed by OS focus
//! notifications and a polling fallback over the usage query. Which one may
//! emit is decided by [`ModeAuthority`], which only the event-driven source
//! flips, through its own connect and disconnect signals.

use std::sync::Arc;

use futures::Stream;
use log::info;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::models::ForegroundEvent;

pub mod event_driven;
pub mod polling;

pub use event_driven::{EventDrivenDetector, FocusSignal, FocusSource};
pub use polling::PollingDetector;

pub type ForegroundSender = mpsc::UnboundedSender<ForegroundEvent>;
pub type ForegroundReceiver = mpsc::UnboundedReceiver<ForegroundEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    EventDriven,
    Polling,
}

/// Single owner of the process-wide monitoring mode.
#[derive(Debug, Clone)]
pub struct ModeAuthority {
    mode: Arc<watch::Sender<MonitoringMode>>,
}

impl ModeAuthority {
    pub fn new() -> Self {
        let (mode, _) = watch::channel(MonitoringMode::Polling);
        Self {
            mode: Arc::new(mode),
        }
    }

    /// Event source is up: it becomes authoritative. Returns whether the mode changed.
    pub fn connect(&self) -> bool {
        self.set(MonitoringMode::EventDriven)
    }

    /// Event source went away: polling takes over. Returns whether the mode changed.
    pub fn disconnect(&self) -> bool {
        self.set(MonitoringMode::Polling)
    }

    pub fn current(&self) -> MonitoringMode {
        *self.mode.borrow()
    }

    pub fn is_authoritative(&self, mode: MonitoringMode) -> bool {
        self.current() == mode
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitoringMode> {
        self.mode.subscribe()
    }

    fn set(&self, next: MonitoringMode) -> bool {
        let changed = self.mode.send_if_modified(|mode| {
            if *mode == next {
                false
            } else {
                *mode = next;
                true
            }
        });
        if changed {
            info!("Monitoring mode switched to {:?}", next);
        }
        changed
    }
}

impl Default for ModeAuthority {
    fn default() -> Self {
        Self::new()
    }
}

/// A source of "app became foreground" events.
///
/// `spawn` may be called again once a previous run has finished, which
/// restarts detection from a clean state.
pub trait ForegroundDetector: Send + Sync + 'static {
    fn mode(&self) -> MonitoringMode;

    fn spawn(self: Arc<Self>, sink: ForegroundSender) -> JoinHandle<()>;
}

pub fn channel() -> (ForegroundSender, ForegroundReceiver) {
    mpsc::unbounded_channel()
}

/// Turns the detector channel into an unbounded stream for consumers.
pub fn event_stream(receiver: ForegroundReceiver) -> impl Stream<Item = ForegroundEvent> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|event| (event, receiver))
    })
}
