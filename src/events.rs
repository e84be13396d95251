use chrono::{DateTime, Local};
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{detector::MonitoringMode, error::MonitorResult, models::AppId};

/// Everything the monitor announces to outside consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    AppLaunched {
        app: AppId,
        at: DateTime<Local>,
    },
    UsageUpdate {
        app: AppId,
        usage_minutes: u32,
        limit_reached: bool,
    },
    CheckAllRequested,
    UsageReset,
    ModeChanged {
        mode: MonitoringMode,
    },
}

/// Receives the raw usage figure of every check, notified or not.
pub trait UsageReportSink: Send + Sync {
    fn report(&self, app: &AppId, usage_minutes: u32, limit_reached: bool);
}

/// Told once per day that usage figures start over.
pub trait UsageResetSink: Send + Sync {
    fn reset(&self) -> MonitorResult<()>;
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: MonitorEvent) {
        // No subscribers is fine, nobody is listening yet.
        if let Err(err) = self.sender.send(event) {
            debug!("Event dropped, no subscribers: {:?}", err.0);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl UsageReportSink for EventBus {
    fn report(&self, app: &AppId, usage_minutes: u32, limit_reached: bool) {
        self.publish(MonitorEvent::UsageUpdate {
            app: app.clone(),
            usage_minutes,
            limit_reached,
        });
    }
}

impl UsageResetSink for EventBus {
    fn reset(&self) -> MonitorResult<()> {
        self.publish(MonitorEvent::UsageReset);
        Ok(())
    }
}
