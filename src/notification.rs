use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use async_trait::async_trait;
use log::info;

use crate::{error::MonitorResult, models::AppId, threshold::Tier};

const NOTIFICATION_ID_WARNING: u32 = 2001;
const NOTIFICATION_ID_LIMIT: u32 = 3001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    High,
}

/// What gets shown to the user when an app crosses a tier.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitNotification {
    pub tier: Tier,
    pub app: AppId,
    pub display_name: String,
    pub usage_minutes: u32,
    pub limit_minutes: u32,
}

impl LimitNotification {
    pub fn title(&self) -> &'static str {
        match self.tier {
            Tier::Normal => "App usage",
            Tier::Approaching => "Approaching limit",
            Tier::Near => "Almost at your limit",
            Tier::Reached => "Limit reached",
        }
    }

    pub fn body(&self) -> String {
        match self.tier {
            Tier::Normal | Tier::Approaching => format!(
                "{}: {} of {} minutes used today",
                self.display_name, self.usage_minutes, self.limit_minutes
            ),
            Tier::Near => format!(
                "{}: {} of {} minutes used, {} minutes left",
                self.display_name,
                self.usage_minutes,
                self.limit_minutes,
                self.limit_minutes.saturating_sub(self.usage_minutes)
            ),
            Tier::Reached => format!(
                "{}: daily limit of {} minutes reached ({} minutes used)",
                self.display_name, self.limit_minutes, self.usage_minutes
            ),
        }
    }

    pub fn urgency(&self) -> Urgency {
        match self.tier {
            Tier::Normal | Tier::Approaching => Urgency::Normal,
            Tier::Near | Tier::Reached => Urgency::High,
        }
    }

    /// Stable per app, so a newer warning replaces the older one on screen.
    pub fn notification_id(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.app.as_str().hash(&mut hasher);
        let offset = (hasher.finish() % 1000) as u32;
        match self.tier {
            Tier::Reached => NOTIFICATION_ID_LIMIT + offset,
            _ => NOTIFICATION_ID_WARNING + offset,
        }
    }
}

/// Delivers notifications. Fire-and-forget: the caller logs failures and moves on.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, notification: &LimitNotification) -> MonitorResult<()>;
}

/// Writes notifications to the log. Used where no native notifier exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send(&self, notification: &LimitNotification) -> MonitorResult<()> {
        info!(
            "[notification {}] {} - {}",
            notification.notification_id(),
            notification.title(),
            notification.body()
        );
        Ok(())
    }
}
