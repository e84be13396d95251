use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use log::{debug, error, info};
use tokio::sync::Mutex;

use crate::{
    dedup::NotificationDeduper,
    error::MonitorResult,
    events::UsageReportSink,
    models::{AppId, UsageLimit},
    notification::{LimitNotification, NotificationDispatcher},
    threshold::{classify, Tier},
    usage::{minutes_today, UsageQuery},
};

/// How soon an app in a warning tier is looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecheckPolicy {
    pub near: Duration,
    pub approaching: Duration,
}

impl RecheckPolicy {
    pub fn delay_for(&self, tier: Tier) -> Option<Duration> {
        match tier {
            Tier::Near => Some(self.near),
            Tier::Approaching => Some(self.approaching),
            Tier::Normal | Tier::Reached => None,
        }
    }
}

impl Default for RecheckPolicy {
    fn default() -> Self {
        Self {
            near: Duration::from_secs(2 * 60),
            approaching: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub app: AppId,
    pub usage_minutes: u32,
    pub percent: f64,
    pub tier: Tier,
    pub notified: bool,
    pub recheck_after: Option<Duration>,
}

/// Runs the per-app usage check. Checks of the same app never overlap.
pub struct UsageChecker {
    usage: Arc<dyn UsageQuery>,
    deduper: NotificationDeduper,
    dispatcher: Arc<dyn NotificationDispatcher>,
    reports: Arc<dyn UsageReportSink>,
    policy: RecheckPolicy,
    in_flight: Mutex<HashMap<AppId, Arc<Mutex<()>>>>,
}

impl UsageChecker {
    pub fn new(
        usage: Arc<dyn UsageQuery>,
        deduper: NotificationDeduper,
        dispatcher: Arc<dyn NotificationDispatcher>,
        reports: Arc<dyn UsageReportSink>,
        policy: RecheckPolicy,
    ) -> Self {
        Self {
            usage,
            deduper,
            dispatcher,
            reports,
            policy,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn usage(&self) -> &Arc<dyn UsageQuery> {
        &self.usage
    }

    async fn app_lock(&self, app: &AppId) -> Arc<Mutex<()>> {
        let mut locks = self.in_flight.lock().await;
        Arc::clone(locks.entry(app.clone()).or_default())
    }

    pub async fn check(&self, limit: &UsageLimit, now: DateTime<Local>) -> MonitorResult<CheckReport> {
        let lock = self.app_lock(&limit.app).await;
        let _guard = lock.lock().await;

        let usage_minutes = minutes_today(self.usage.as_ref(), &limit.app, now).await?;
        let (percent, tier) = classify(usage_minutes, limit.limit_minutes);
        debug!(
            "App usage for {}: {} min ({:.0}% of limit, {})",
            limit.app,
            usage_minutes,
            percent,
            tier.as_str()
        );

        self.reports.report(&limit.app, usage_minutes, percent >= 100.0);

        let notified = tier.is_warning()
            && self
                .deduper
                .try_claim(&limit.app, now.date_naive(), tier)
                .await?;
        if notified {
            self.dispatch(limit, tier, usage_minutes).await;
        }

        Ok(CheckReport {
            app: limit.app.clone(),
            usage_minutes,
            percent,
            tier,
            notified,
            recheck_after: self.policy.delay_for(tier),
        })
    }

    async fn dispatch(&self, limit: &UsageLimit, tier: Tier, usage_minutes: u32) {
        let notification = LimitNotification {
            tier,
            app: limit.app.clone(),
            display_name: limit.display_name.clone(),
            usage_minutes,
            limit_minutes: limit.minutes(),
        };
        // The flag is already claimed: a failed send is a missed notification, never a duplicate.
        match self.dispatcher.send(&notification).await {
            Ok(()) => info!("Sent {} notification for {}", tier.as_str(), limit.app),
            Err(err) => error!("Failed to send {} notification for {}: {}", tier.as_str(), limit.app, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::MonitorError,
        testing::{FakeUsage, RecordingDispatcher, RecordingReports},
    };
    use chrono::Duration as ChronoDuration;

    struct Harness {
        usage: Arc<FakeUsage>,
        dispatcher: Arc<RecordingDispatcher>,
        reports: Arc<RecordingReports>,
        checker: UsageChecker,
    }

    fn harness() -> Harness {
        let usage = Arc::new(FakeUsage::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let reports = Arc::new(RecordingReports::default());
        let checker = UsageChecker::new(
            usage.clone(),
            NotificationDeduper::in_memory(),
            dispatcher.clone(),
            reports.clone(),
            RecheckPolicy::default(),
        );
        Harness {
            usage,
            dispatcher,
            reports,
            checker,
        }
    }

    fn limit(app: &str, minutes: u32) -> UsageLimit {
        UsageLimit::new(AppId::new(app), minutes, app.trim_end_matches(".exe")).unwrap()
    }

    #[tokio::test]
    async fn test_approaching_notifies_once_and_rechecks_in_five_minutes() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 50).await;
        let limit = limit("reddit.exe", 60);
        let now = Local::now();

        let first = h.checker.check(&limit, now).await.unwrap();
        assert_eq!(first.tier, Tier::Approaching);
        assert!((first.percent - 83.3).abs() < 0.1);
        assert!(first.notified);
        assert_eq!(first.recheck_after, Some(Duration::from_secs(300)));

        let second = h.checker.check(&limit, now).await.unwrap();
        assert!(!second.notified);
        assert_eq!(second.recheck_after, Some(Duration::from_secs(300)));

        assert_eq!(h.dispatcher.sent_tiers(), vec![Tier::Approaching]);
        assert_eq!(
            h.reports.reports(),
            vec![
                (AppId::new("reddit.exe"), 50, false),
                (AppId::new("reddit.exe"), 50, false)
            ]
        );
    }

    #[tokio::test]
    async fn test_reached_notifies_once_per_day_without_recheck() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 60).await;
        let limit = limit("reddit.exe", 60);
        let now = Local::now();

        let first = h.checker.check(&limit, now).await.unwrap();
        let second = h.checker.check(&limit, now).await.unwrap();

        assert_eq!(first.tier, Tier::Reached);
        assert!(first.notified && !second.notified);
        assert_eq!(first.recheck_after, None);
        assert_eq!(second.recheck_after, None);
        assert_eq!(h.dispatcher.sent_tiers(), vec![Tier::Reached]);
        assert!(h.reports.reports().iter().all(|(_, minutes, reached)| *minutes == 60 && *reached));
    }

    #[tokio::test]
    async fn test_concurrent_checks_dispatch_once() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 75).await;
        let limit = limit("reddit.exe", 60);
        let now = Local::now();

        let (a, b) = tokio::join!(h.checker.check(&limit, now), h.checker.check(&limit, now));
        assert!(a.unwrap().notified ^ b.unwrap().notified);
        assert_eq!(h.dispatcher.sent_tiers().len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_notifies_each_tier() {
        let h = harness();
        let limit = limit("reddit.exe", 100);
        let now = Local::now();

        for minutes in [10, 80, 90, 96, 99, 100, 120] {
            h.usage.set_minutes("reddit.exe", minutes).await;
            h.checker.check(&limit, now).await.unwrap();
        }
        assert_eq!(
            h.dispatcher.sent_tiers(),
            vec![Tier::Approaching, Tier::Near, Tier::Reached]
        );
    }

    #[tokio::test]
    async fn test_near_rechecks_in_two_minutes() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 58).await;
        let report = h.checker.check(&limit("reddit.exe", 60), Local::now()).await.unwrap();
        assert_eq!(report.tier, Tier::Near);
        assert_eq!(report.recheck_after, Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_normal_reports_but_stays_quiet() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 5).await;
        let report = h.checker.check(&limit("reddit.exe", 60), Local::now()).await.unwrap();
        assert_eq!(report.tier, Tier::Normal);
        assert!(!report.notified);
        assert_eq!(report.recheck_after, None);
        assert!(h.dispatcher.sent_tiers().is_empty());
        assert_eq!(h.reports.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_next_day_notifies_again() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 60).await;
        let limit = limit("reddit.exe", 60);
        let today = Local::now();

        h.checker.check(&limit, today).await.unwrap();
        let tomorrow = h.checker.check(&limit, today + ChronoDuration::days(1)).await.unwrap();
        assert!(tomorrow.notified);
        assert_eq!(h.dispatcher.sent_tiers(), vec![Tier::Reached, Tier::Reached]);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_not_retried() {
        let h = harness();
        h.usage.set_minutes("reddit.exe", 60).await;
        h.dispatcher.fail_sends(true);
        let limit = limit("reddit.exe", 60);

        let first = h.checker.check(&limit, Local::now()).await.unwrap();
        h.dispatcher.fail_sends(false);
        let second = h.checker.check(&limit, Local::now()).await.unwrap();

        assert!(first.notified);
        assert!(!second.notified);
        assert!(h.dispatcher.sent_tiers().is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_surfaces_without_report() {
        let h = harness();
        h.usage.fail_queries(true);
        let result = h.checker.check(&limit("reddit.exe", 60), Local::now()).await;
        assert!(matches!(result, Err(MonitorError::UsageQuery(_))));
        assert!(h.reports.reports().is_empty());
    }
}
