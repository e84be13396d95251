use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::{mpsc, Mutex};

use crate::{
    detector::{FocusSignal, FocusSource},
    error::{MonitorError, MonitorResult},
    events::{UsageReportSink, UsageResetSink},
    models::{AppId, UsageSample},
    notification::{LimitNotification, NotificationDispatcher},
    threshold::Tier,
    usage::{AppFilter, UsageQuery},
};

#[derive(Default)]
pub struct FakeUsage {
    minutes: Mutex<HashMap<AppId, u32>>,
    last_used: Mutex<HashMap<AppId, DateTime<Local>>>,
    fail: AtomicBool,
    unavailable: AtomicBool,
    queries: AtomicUsize,
    latency_ms: AtomicU64,
}

impl FakeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_minutes(&self, app: &str, minutes: u32) {
        self.minutes.lock().await.insert(AppId::new(app), minutes);
    }

    pub async fn set_last_used(&self, app: &str, at: DateTime<Local>) {
        self.last_used.lock().await.insert(AppId::new(app), at);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn deny_access(&self, denied: bool) {
        self.unavailable.store(denied, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Every query takes `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl UsageQuery for FakeUsage {
    async fn query(
        &self,
        filter: &AppFilter,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
    ) -> MonitorResult<Vec<UsageSample>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MonitorError::UsageQuery("usage service unavailable".into()));
        }

        let minutes = self.minutes.lock().await;
        let last_used = self.last_used.lock().await;
        let mut apps: Vec<&AppId> = minutes.keys().chain(last_used.keys()).collect();
        apps.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        apps.dedup();

        Ok(apps
            .into_iter()
            .filter(|app| filter.matches(app))
            .map(|app| UsageSample {
                app: app.clone(),
                window_start,
                window_end,
                foreground_minutes: minutes.get(app).copied().unwrap_or(0),
                last_used: last_used.get(app).copied(),
            })
            .collect())
    }

    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

/// Replays a fixed list of signals, then ends the subscription.
#[derive(Default)]
pub struct ScriptedFocusSource {
    script: Vec<FocusSignal>,
}

impl ScriptedFocusSource {
    pub fn new(script: Vec<FocusSignal>) -> Self {
        Self { script }
    }
}

impl FocusSource for ScriptedFocusSource {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<FocusSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        for signal in &self.script {
            let _ = tx.send(signal.clone());
        }
        rx
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    sent: StdMutex<Vec<LimitNotification>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<LimitNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_tiers(&self) -> Vec<Tier> {
        self.sent().into_iter().map(|n| n.tier).collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, notification: &LimitNotification) -> MonitorResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MonitorError::Dispatch("notifier offline".into()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReports {
    reports: StdMutex<Vec<(AppId, u32, bool)>>,
}

impl RecordingReports {
    pub fn reports(&self) -> Vec<(AppId, u32, bool)> {
        self.reports.lock().unwrap().clone()
    }
}

impl UsageReportSink for RecordingReports {
    fn report(&self, app: &AppId, usage_minutes: u32, limit_reached: bool) {
        self.reports
            .lock()
            .unwrap()
            .push((app.clone(), usage_minutes, limit_reached));
    }
}

#[derive(Default)]
pub struct RecordingResets {
    count: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingResets {
    pub fn fail_resets(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl UsageResetSink for RecordingResets {
    fn reset(&self) -> MonitorResult<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MonitorError::Transport("reset consumer gone".into()));
        }
        Ok(())
    }
}
