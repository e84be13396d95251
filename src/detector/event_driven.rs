use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Local};
use log::{debug, info};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use super::{ForegroundDetector, ForegroundSender, ModeAuthority, MonitoringMode};
use crate::models::{AppId, ForegroundEvent};

/// Shell surfaces that take focus without being an "app" the user chose.
pub const DEFAULT_IGNORED_APPS: [&str; 6] = [
    "ShellExperienceHost.exe",
    "StartMenuExperienceHost.exe",
    "SearchHost.exe",
    "TextInputHost.exe",
    "ApplicationFrameHost.exe",
    "LockApp.exe",
];

#[derive(Debug, Clone, PartialEq)]
pub enum FocusSignal {
    Connected,
    Focused { app: AppId, at: DateTime<Local> },
    Disconnected,
}

/// OS-level focus change notifications.
pub trait FocusSource: Send + Sync {
    /// Opens a new subscription. The channel closing ends the subscription.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<FocusSignal>;
}

pub struct EventDrivenDetector {
    source: Arc<dyn FocusSource>,
    authority: ModeAuthority,
    self_app: AppId,
    ignored: HashSet<AppId>,
    last_emitted: Mutex<Option<AppId>>,
}

impl EventDrivenDetector {
    pub fn new(source: Arc<dyn FocusSource>, authority: ModeAuthority, self_app: AppId) -> Self {
        Self {
            source,
            authority,
            self_app,
            ignored: DEFAULT_IGNORED_APPS.iter().map(|app| AppId::new(*app)).collect(),
            last_emitted: Mutex::new(None),
        }
    }

    pub fn with_ignored(mut self, apps: impl IntoIterator<Item = AppId>) -> Self {
        self.ignored = apps.into_iter().collect();
        self
    }

    fn is_ignored(&self, app: &AppId) -> bool {
        *app == self.self_app || self.ignored.contains(app)
    }

    /// Applies one signal and returns the event to emit, if any.
    pub async fn handle(&self, signal: FocusSignal) -> Option<ForegroundEvent> {
        match signal {
            FocusSignal::Connected => {
                *self.last_emitted.lock().await = None;
                self.authority.connect();
                None
            }
            FocusSignal::Disconnected => {
                self.authority.disconnect();
                None
            }
            FocusSignal::Focused { app, at } => {
                if self.is_ignored(&app) {
                    return None;
                }
                let mut last = self.last_emitted.lock().await;
                if last.as_ref() == Some(&app) {
                    return None;
                }
                if !self.authority.is_authoritative(MonitoringMode::EventDriven) {
                    debug!("Focus on {} ignored, event source is not authoritative", app);
                    return None;
                }
                *last = Some(app.clone());
                Some(ForegroundEvent::new(app, at))
            }
        }
    }

    async fn run(self: Arc<Self>, sink: ForegroundSender) {
        let mut signals = self.source.subscribe();
        info!("Event-driven foreground detection subscribed");

        while let Some(signal) = signals.recv().await {
            if let Some(event) = self.handle(signal).await {
                debug!("App changed: {}", event.app);
                if sink.send(event).is_err() {
                    break;
                }
            }
        }

        self.authority.disconnect();
        info!("Event-driven foreground detection ended");
    }
}

impl ForegroundDetector for EventDrivenDetector {
    fn mode(&self) -> MonitoringMode {
        MonitoringMode::EventDriven
    }

    fn spawn(self: Arc<Self>, sink: ForegroundSender) -> JoinHandle<()> {
        tokio::spawn(self.run(sink))
    }
}
