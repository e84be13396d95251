use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike};

use crate::{
    error::MonitorResult,
    models::{AppId, UsageSample},
};

/// Which apps a usage query should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFilter {
    All,
    One(AppId),
    Apps(Vec<AppId>),
}

impl AppFilter {
    pub fn matches(&self, app: &AppId) -> bool {
        match self {
            AppFilter::All => true,
            AppFilter::One(id) => id == app,
            AppFilter::Apps(ids) => ids.contains(app),
        }
    }
}

/// Read-only access to the host's accumulated foreground time.
#[async_trait]
pub trait UsageQuery: Send + Sync {
    async fn query(
        &self,
        filter: &AppFilter,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
    ) -> MonitorResult<Vec<UsageSample>>;

    /// Whether usage data can be read at all (usage access granted).
    async fn is_available(&self) -> bool {
        true
    }
}

/// Local midnight of the day `now` falls on.
pub fn start_of_day(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .unwrap_or_else(|| {
            now - chrono::Duration::seconds(i64::from(now.num_seconds_from_midnight()))
                - chrono::Duration::nanoseconds(i64::from(now.nanosecond()))
        })
}

/// Foreground minutes for `app` over [local midnight, now).
pub async fn minutes_today(
    usage: &dyn UsageQuery,
    app: &AppId,
    now: DateTime<Local>,
) -> MonitorResult<u32> {
    let samples = usage
        .query(&AppFilter::One(app.clone()), start_of_day(now), now)
        .await?;
    Ok(samples
        .iter()
        .filter(|sample| &sample.app == app)
        .map(|sample| sample.foreground_minutes)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeUsage;
    use chrono::TimeZone;

    #[test]
    fn test_filter_matches() {
        let chrome = AppId::new("chrome.exe");
        let code = AppId::new("code.exe");
        assert!(AppFilter::All.matches(&chrome));
        assert!(AppFilter::One(chrome.clone()).matches(&chrome));
        assert!(!AppFilter::One(chrome.clone()).matches(&code));
        assert!(AppFilter::Apps(vec![code.clone()]).matches(&code));
        assert!(!AppFilter::Apps(vec![code]).matches(&chrome));
    }

    #[test]
    fn test_start_of_day_is_midnight() {
        let now = Local.with_ymd_and_hms(2024, 6, 12, 15, 42, 7).unwrap();
        let midnight = start_of_day(now);
        assert_eq!(midnight.date_naive(), now.date_naive());
        assert_eq!(midnight.hour(), 0);
        assert_eq!(midnight.minute(), 0);
        assert_eq!(midnight.second(), 0);
    }

    #[tokio::test]
    async fn test_minutes_today_only_counts_requested_app() {
        let usage = FakeUsage::new();
        usage.set_minutes("chrome.exe", 42).await;
        usage.set_minutes("code.exe", 7).await;

        let minutes = minutes_today(&usage, &AppId::new("chrome.exe"), Local::now())
            .await
            .unwrap();
        assert_eq!(minutes, 42);
    }
}
