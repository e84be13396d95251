use chrono::{DateTime, Local, SecondsFormat, Utc};
use rusqlite::types::Type;

use crate::models::AppId;

/// One stretch of time an app spent in the foreground. An open period has no end yet.
#[derive(Debug, Clone, PartialEq)]
pub struct UsagePeriod {
    pub id: String,
    pub app_name: AppId,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
}

impl UsagePeriod {
    /// Seconds of this period inside `[window_start, window_end)`, with an open
    /// period counted up to `now`.
    pub fn overlap_secs(
        &self,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
        now: DateTime<Local>,
    ) -> i64 {
        let start = self.start_time.max(window_start);
        let end = self.end_time.unwrap_or(now).min(window_end);
        (end - start).num_seconds().max(0)
    }

    /// Last instant inside the window at which the app was in the foreground.
    pub fn last_seen(&self, window_end: DateTime<Local>, now: DateTime<Local>) -> DateTime<Local> {
        self.end_time.unwrap_or(now).min(window_end)
    }
}

/// Timestamps are stored as UTC RFC 3339 text so they compare correctly as strings.
pub fn to_sql_time(at: DateTime<Local>) -> String {
    at.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_sql_time(column: usize, value: &str) -> rusqlite::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Local))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err)))
}
