use std::{fmt, num::NonZeroU32, time::Duration};

use chrono::{DateTime, Local};
use internment::ArcIntern;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MonitorError, MonitorResult};

/// Identifier of an installed application, e.g. an executable name.
///
/// Interned, so clones are cheap and equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AppId(ArcIntern<String>);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ArcIntern::new(id.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<AppId> for String {
    fn from(value: AppId) -> Self {
        value.0.to_string()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A daily limit configured for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageLimit {
    pub app: AppId,
    pub limit_minutes: NonZeroU32,
    pub display_name: String,
}

impl UsageLimit {
    /// Rejects a zero limit instead of coercing it.
    pub fn new(app: AppId, limit_minutes: u32, display_name: impl Into<String>) -> MonitorResult<Self> {
        let limit_minutes = NonZeroU32::new(limit_minutes).ok_or_else(|| MonitorError::InvalidLimit {
            app: app.clone(),
            limit_minutes,
        })?;
        Ok(Self {
            app,
            limit_minutes,
            display_name: display_name.into(),
        })
    }

    pub fn minutes(&self) -> u32 {
        self.limit_minutes.get()
    }
}

/// Foreground time accumulated by one app inside a query window.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub app: AppId,
    pub window_start: DateTime<Local>,
    pub window_end: DateTime<Local>,
    pub foreground_minutes: u32,
    pub last_used: Option<DateTime<Local>>,
}

/// "App became foreground" as emitted by a detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForegroundEvent {
    pub app: AppId,
    pub at: DateTime<Local>,
}

impl ForegroundEvent {
    pub fn new(app: AppId, at: DateTime<Local>) -> Self {
        Self { app, at }
    }
}

/// A pending intensive re-check of one app.
#[derive(Debug, Clone)]
pub struct ScheduledCheck {
    pub id: Uuid,
    pub limit: UsageLimit,
    pub delay: Duration,
    pub not_before: DateTime<Local>,
    pub attempt: u32,
}

impl ScheduledCheck {
    pub fn new(limit: UsageLimit, delay: Duration, attempt: u32) -> Self {
        let not_before = Local::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            limit,
            delay,
            not_before,
            attempt,
        }
    }
}
