//! Adaptive re-check scheduling.
//!
//! A regular cadence checks every limited app once per window. Apps found in a
//! warning tier get an intensive re-check on top of that, sooner the closer
//! they are to their limit. Each app has at most one pending intensive check;
//! scheduling another supersedes it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Local;
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    events::{EventBus, MonitorEvent},
    fs_watcher::LimitRegistry,
    models::{AppId, ScheduledCheck, UsageLimit},
};

pub mod check;

pub use check::{CheckReport, RecheckPolicy, UsageChecker};

const RETRY_BASE: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Regular window length and the flex span at its end in which the pass fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub interval: Duration,
    pub flex: Duration,
}

impl Cadence {
    pub fn new(interval: Duration, flex: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        Self {
            interval,
            flex: flex.min(interval),
        }
    }

    /// Offset from a window's start at which its pass fires.
    pub fn fire_offset(&self) -> Duration {
        let earliest = self.interval - self.flex;
        let flex_ms = self.flex.as_millis() as u64;
        if flex_ms == 0 {
            return earliest;
        }
        earliest + Duration::from_millis(rand::thread_rng().gen_range(0..=flex_ms))
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self::new(Duration::from_secs(20 * 60), Duration::from_secs(5 * 60))
    }
}

/// Backoff for an intensive check that failed transiently.
pub fn retry_delay(attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    RETRY_BASE.saturating_mul(factor).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Dormant,
    ScheduledRegular,
    ScheduledIntensive(Duration),
}

struct PendingCheck {
    check: ScheduledCheck,
    token: CancellationToken,
}

/// Snapshot of the cancellation counters an in-flight check started under.
/// A follow-up is only scheduled while the snapshot still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    epoch: u64,
    generation: u64,
}

/// Pending intensive checks plus the counters that outlive them: `epoch`
/// moves on every `stop`, an app's generation on every schedule or cancel.
#[derive(Default)]
struct Slots {
    pending: HashMap<AppId, PendingCheck>,
    epoch: u64,
    generations: HashMap<AppId, u64>,
}

impl Slots {
    fn ticket(&self, app: &AppId) -> Ticket {
        Ticket {
            epoch: self.epoch,
            generation: self.generations.get(app).copied().unwrap_or(0),
        }
    }

    fn bump(&mut self, app: &AppId) {
        *self.generations.entry(app.clone()).or_default() += 1;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct CheckScheduler {
    checker: Arc<UsageChecker>,
    limits: LimitRegistry,
    bus: EventBus,
    cadence: Cadence,
    regular: Arc<Mutex<Option<CancellationToken>>>,
    intensive: Arc<Mutex<Slots>>,
}

impl CheckScheduler {
    pub fn new(checker: Arc<UsageChecker>, limits: LimitRegistry, bus: EventBus, cadence: Cadence) -> Self {
        Self {
            checker,
            limits,
            bus,
            cadence,
            regular: Arc::new(Mutex::new(None)),
            intensive: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub fn checker(&self) -> &Arc<UsageChecker> {
        &self.checker
    }

    pub fn limits(&self) -> &LimitRegistry {
        &self.limits
    }

    /// (Re)starts the regular cadence. A cadence already running is replaced.
    pub fn start_regular(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.regular).replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(self.clone().run_regular(token));
        info!(
            "Regular usage checks every {:?} (flex {:?})",
            self.cadence.interval, self.cadence.flex
        );
    }

    pub fn is_running(&self) -> bool {
        lock(&self.regular).is_some()
    }

    /// Cancels the regular cadence and every pending intensive check. Checks
    /// already running complete but schedule nothing further.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.regular).take() {
            token.cancel();
        }
        let pending: Vec<PendingCheck> = {
            let mut slots = lock(&self.intensive);
            slots.epoch += 1;
            slots.pending.drain().map(|(_, p)| p).collect()
        };
        for p in &pending {
            p.token.cancel();
        }
        info!("Usage checks stopped, {} intensive checks cancelled", pending.len());
    }

    /// Runs one check of every limited app right away.
    pub async fn check_all(&self) -> usize {
        self.pass(None).await
    }

    /// Schedules an intensive check of one app after `delay`, replacing any
    /// check already pending for it.
    pub fn schedule_intensive(&self, limit: UsageLimit, delay: Duration) -> Uuid {
        let check = ScheduledCheck::new(limit, delay, 0);
        let id = check.id;
        self.enqueue(check, None);
        id
    }

    /// Cancels intensive checks of `app`. A check already running completes
    /// without scheduling another. Returns whether a pending one existed.
    pub fn cancel_checks(&self, app: &AppId) -> bool {
        let pending = {
            let mut slots = lock(&self.intensive);
            slots.bump(app);
            slots.pending.remove(app)
        };
        match pending {
            Some(pending) => {
                pending.token.cancel();
                info!("Cancelled intensive check of {}", app);
                true
            }
            None => false,
        }
    }

    pub fn pending_checks(&self) -> Vec<ScheduledCheck> {
        lock(&self.intensive)
            .pending
            .values()
            .map(|pending| pending.check.clone())
            .collect()
    }

    pub fn state(&self, app: &AppId) -> CheckState {
        if let Some(pending) = lock(&self.intensive).pending.get(app) {
            return CheckState::ScheduledIntensive(pending.check.delay);
        }
        if self.is_running() {
            CheckState::ScheduledRegular
        } else {
            CheckState::Dormant
        }
    }

    /// Puts `check` in its app's slot, superseding the previous one. With a
    /// `ticket`, nothing is scheduled if the app was cancelled or the
    /// scheduler stopped since the ticket was taken.
    fn enqueue(&self, check: ScheduledCheck, ticket: Option<Ticket>) -> bool {
        let token = CancellationToken::new();
        let app = check.limit.app.clone();
        {
            let mut slots = lock(&self.intensive);
            if ticket.is_some_and(|ticket| ticket != slots.ticket(&app)) {
                debug!("Not rescheduling {}, its checks were cancelled", app);
                return false;
            }
            slots.bump(&app);
            let pending = PendingCheck {
                check: check.clone(),
                token: token.clone(),
            };
            if let Some(previous) = slots.pending.insert(app, pending) {
                previous.token.cancel();
            }
        }
        debug!(
            "Intensive check of {} in {:?} (attempt {})",
            check.limit.app, check.delay, check.attempt
        );
        tokio::spawn(self.clone().run_intensive(check, token));
        true
    }

    /// Claims the pending slot for `app` if it still belongs to check `id`.
    fn take_pending(&self, app: &AppId, id: Uuid) -> Option<Ticket> {
        let mut slots = lock(&self.intensive);
        match slots.pending.get(app) {
            Some(pending) if pending.check.id == id && !pending.token.is_cancelled() => {
                slots.pending.remove(app);
                Some(slots.ticket(app))
            }
            _ => None,
        }
    }

    fn follow_up(&self, limit: &UsageLimit, report: &CheckReport, ticket: Ticket) {
        if let Some(delay) = report.recheck_after {
            self.enqueue(ScheduledCheck::new(limit.clone(), delay, 0), Some(ticket));
        }
    }

    async fn run_intensive(self, check: ScheduledCheck, token: CancellationToken) {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = sleep(check.delay) => {}
        }
        // Past this point the check runs to completion even if cancelled.
        let Some(ticket) = self.take_pending(&check.limit.app, check.id) else {
            return;
        };

        match self.checker.check(&check.limit, Local::now()).await {
            Ok(report) => self.follow_up(&check.limit, &report, ticket),
            Err(err) if err.is_transient() => {
                let delay = retry_delay(check.attempt, self.cadence.interval);
                let retry = ScheduledCheck::new(check.limit.clone(), delay, check.attempt + 1);
                if self.enqueue(retry, Some(ticket)) {
                    warn!(
                        "Intensive check of {} failed, retrying in {:?}: {}",
                        check.limit.app, delay, err
                    );
                } else {
                    warn!("Intensive check of {} failed: {}", check.limit.app, err);
                }
            }
            Err(err) => error!("Dropping intensive check of {}: {}", check.limit.app, err),
        }
    }

    async fn pass(&self, cadence: Option<&CancellationToken>) -> usize {
        self.bus.publish(MonitorEvent::CheckAllRequested);
        let limits = self.limits.snapshot().await;
        if limits.is_empty() {
            debug!("No limits configured, nothing to check");
            return 0;
        }

        let tickets: Vec<Ticket> = {
            let slots = lock(&self.intensive);
            limits.iter().map(|limit| slots.ticket(&limit.app)).collect()
        };
        let now = Local::now();
        let results = join_all(limits.iter().map(|limit| self.checker.check(limit, now))).await;
        let replaced = cadence.is_some_and(CancellationToken::is_cancelled);

        for ((limit, ticket), result) in limits.iter().zip(tickets).zip(results) {
            match result {
                Ok(report) if !replaced => self.follow_up(limit, &report, ticket),
                Ok(_) => {}
                Err(err) => warn!("Usage check of {} failed, retrying next pass: {}", limit.app, err),
            }
        }
        limits.len()
    }

    async fn run_regular(self, token: CancellationToken) {
        let interval = self.cadence.interval;
        let mut window_start = Instant::now();

        loop {
            let fire_at = window_start + self.cadence.fire_offset();
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep_until(fire_at) => {}
            }

            let checked = self.pass(Some(&token)).await;
            debug!("Regular pass checked {} apps", checked);

            window_start += interval;
            // A pass that overran whole windows does not cause a burst of catch-up passes.
            while window_start + interval <= Instant::now() {
                window_start += interval;
            }
        }
        debug!("Regular cadence ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dedup::NotificationDeduper,
        testing::{FakeUsage, RecordingDispatcher},
        threshold::Tier,
    };

    struct Harness {
        usage: Arc<FakeUsage>,
        dispatcher: Arc<RecordingDispatcher>,
        bus: EventBus,
        scheduler: CheckScheduler,
    }

    fn harness(limits: Vec<UsageLimit>) -> Harness {
        let usage = Arc::new(FakeUsage::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let bus = EventBus::new(64);
        let checker = Arc::new(UsageChecker::new(
            usage.clone(),
            NotificationDeduper::in_memory(),
            dispatcher.clone(),
            Arc::new(bus.clone()),
            RecheckPolicy::default(),
        ));
        let scheduler = CheckScheduler::new(checker, LimitRegistry::new(limits), bus.clone(), Cadence::default());
        Harness {
            usage,
            dispatcher,
            bus,
            scheduler,
        }
    }

    fn limit(app: &str, minutes: u32) -> UsageLimit {
        UsageLimit::new(AppId::new(app), minutes, app).unwrap()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_fire_offset_stays_in_flex_window() {
        let cadence = Cadence::default();
        for _ in 0..500 {
            let offset = cadence.fire_offset();
            assert!(offset >= secs(15 * 60) && offset <= secs(20 * 60));
        }
        let rigid = Cadence::new(secs(600), Duration::ZERO);
        assert_eq!(rigid.fire_offset(), secs(600));
        assert_eq!(Cadence::new(secs(60), secs(600)).flex, secs(60));
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        let cap = secs(20 * 60);
        assert_eq!(retry_delay(0, cap), secs(60));
        assert_eq!(retry_delay(1, cap), secs(120));
        assert_eq!(retry_delay(4, cap), secs(16 * 60));
        assert_eq!(retry_delay(5, cap), cap);
        assert_eq!(retry_delay(64, cap), cap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intensive_check_fires_after_delay_and_follows_up() {
        let h = harness(Vec::new());
        h.usage.set_minutes("reddit.exe", 50).await;
        let app = AppId::new("reddit.exe");

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(30));
        assert_eq!(h.scheduler.state(&app), CheckState::ScheduledIntensive(secs(30)));

        sleep(secs(29)).await;
        assert_eq!(h.usage.query_count(), 0);

        sleep(secs(2)).await;
        assert_eq!(h.dispatcher.sent_tiers(), vec![Tier::Approaching]);
        assert_eq!(h.scheduler.state(&app), CheckState::ScheduledIntensive(secs(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_schedule_supersedes_previous() {
        let h = harness(Vec::new());
        h.usage.set_minutes("reddit.exe", 50).await;

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(60));
        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(10));
        assert_eq!(h.scheduler.pending_checks().len(), 1);

        sleep(secs(61)).await;
        assert_eq!(h.usage.query_count(), 1);
        assert_eq!(h.dispatcher.sent_tiers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_check_never_fires() {
        let h = harness(Vec::new());
        let app = AppId::new("reddit.exe");

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(10));
        assert!(h.scheduler.cancel_checks(&app));
        assert!(!h.scheduler.cancel_checks(&app));

        sleep(secs(20)).await;
        assert_eq!(h.usage.query_count(), 0);
        assert_eq!(h.scheduler.state(&app), CheckState::Dormant);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_per_app() {
        let h = harness(Vec::new());
        h.usage.set_minutes("steam.exe", 5).await;

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(10));
        h.scheduler.schedule_intensive(limit("steam.exe", 60), secs(10));
        h.scheduler.cancel_checks(&AppId::new("reddit.exe"));

        sleep(secs(11)).await;
        assert_eq!(h.usage.query_count(), 1);
        // Normal tier: nothing left pending.
        assert!(h.scheduler.pending_checks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_cadence_fires_once_per_window() {
        let h = harness(vec![limit("steam.exe", 60)]);
        h.usage.set_minutes("steam.exe", 5).await;
        let mut events = h.bus.subscribe();
        let app = AppId::new("steam.exe");

        h.scheduler.start_regular();
        assert_eq!(h.scheduler.state(&app), CheckState::ScheduledRegular);

        sleep(secs(15 * 60 - 1)).await;
        assert_eq!(h.usage.query_count(), 0);

        sleep(secs(5 * 60 + 2)).await;
        assert_eq!(h.usage.query_count(), 1);
        assert_eq!(events.try_recv().unwrap(), MonitorEvent::CheckAllRequested);

        sleep(secs(20 * 60)).await;
        assert_eq!(h.usage.query_count(), 2);

        h.scheduler.stop();
        assert_eq!(h.scheduler.state(&app), CheckState::Dormant);
        sleep(secs(60 * 60)).await;
        assert_eq!(h.usage.query_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_intensive_checks() {
        let h = harness(Vec::new());
        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(10));
        h.scheduler.schedule_intensive(limit("steam.exe", 60), secs(10));
        h.scheduler.start_regular();

        h.scheduler.stop();
        assert!(h.scheduler.pending_checks().is_empty());
        assert!(!h.scheduler.is_running());

        sleep(secs(25 * 60)).await;
        assert_eq!(h.usage.query_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_running_check_schedules_nothing_more() {
        let h = harness(Vec::new());
        h.usage.set_minutes("reddit.exe", 50).await;
        h.usage.set_latency(secs(10));

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), Duration::ZERO);
        sleep(secs(1)).await;
        assert_eq!(h.usage.query_count(), 1);

        h.scheduler.stop();
        sleep(secs(30 * 60)).await;

        // The running check completes, nothing fires afterwards.
        assert_eq!(h.dispatcher.sent_tiers(), vec![Tier::Approaching]);
        assert_eq!(h.usage.query_count(), 1);
        assert!(h.scheduler.pending_checks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_running_check_is_per_app() {
        let h = harness(Vec::new());
        h.usage.set_minutes("reddit.exe", 50).await;
        h.usage.set_minutes("steam.exe", 58).await;
        h.usage.set_latency(secs(10));
        let reddit = AppId::new("reddit.exe");
        let steam = AppId::new("steam.exe");

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), Duration::ZERO);
        h.scheduler.schedule_intensive(limit("steam.exe", 60), Duration::ZERO);
        sleep(secs(1)).await;
        assert_eq!(h.usage.query_count(), 2);

        // Nothing is pending while the check runs.
        assert!(!h.scheduler.cancel_checks(&reddit));
        sleep(secs(20)).await;

        assert_eq!(h.dispatcher.sent_tiers().len(), 2);
        assert_eq!(h.scheduler.state(&reddit), CheckState::Dormant);
        assert_eq!(h.scheduler.state(&steam), CheckState::ScheduledIntensive(secs(120)));

        sleep(secs(30 * 60)).await;
        assert!(h.scheduler.pending_checks().iter().all(|check| check.limit.app == steam));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_during_running_check_is_kept() {
        let h = harness(Vec::new());
        h.usage.set_minutes("reddit.exe", 50).await;
        h.usage.set_latency(secs(10));
        let app = AppId::new("reddit.exe");

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), Duration::ZERO);
        sleep(secs(1)).await;
        h.scheduler.schedule_intensive(limit("reddit.exe", 60), secs(60));
        sleep(secs(20)).await;

        // The running check's own follow-up does not replace the newer request.
        assert_eq!(h.scheduler.state(&app), CheckState::ScheduledIntensive(secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_check_all_schedules_nothing() {
        let h = harness(vec![limit("reddit.exe", 60)]);
        h.usage.set_minutes("reddit.exe", 50).await;
        h.usage.set_latency(secs(10));

        let scheduler = h.scheduler.clone();
        let pass = tokio::spawn(async move { scheduler.check_all().await });
        sleep(secs(1)).await;
        h.scheduler.stop();

        assert_eq!(pass.await.unwrap(), 1);
        assert!(h.scheduler.pending_checks().is_empty());
        sleep(secs(30 * 60)).await;
        assert_eq!(h.usage.query_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_with_backoff() {
        let h = harness(Vec::new());
        h.usage.fail_queries(true);
        let app = AppId::new("reddit.exe");

        h.scheduler.schedule_intensive(limit("reddit.exe", 60), Duration::ZERO);
        sleep(secs(1)).await;
        assert_eq!(h.usage.query_count(), 1);
        assert_eq!(h.scheduler.state(&app), CheckState::ScheduledIntensive(secs(60)));

        sleep(secs(60)).await;
        assert_eq!(h.usage.query_count(), 2);
        assert_eq!(h.scheduler.state(&app), CheckState::ScheduledIntensive(secs(120)));

        h.usage.fail_queries(false);
        h.usage.set_minutes("reddit.exe", 5).await;
        sleep(secs(121)).await;
        assert_eq!(h.usage.query_count(), 3);
        assert_eq!(h.scheduler.state(&app), CheckState::Dormant);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_all_schedules_warning_apps_only() {
        let h = harness(vec![limit("reddit.exe", 60), limit("steam.exe", 60)]);
        h.usage.set_minutes("reddit.exe", 50).await;
        h.usage.set_minutes("steam.exe", 5).await;

        assert_eq!(h.scheduler.check_all().await, 2);
        assert_eq!(h.dispatcher.sent_tiers(), vec![Tier::Approaching]);
        assert_eq!(
            h.scheduler.state(&AppId::new("reddit.exe")),
            CheckState::ScheduledIntensive(secs(300))
        );
        assert_eq!(h.scheduler.state(&AppId::new("steam.exe")), CheckState::Dormant);
    }
}
