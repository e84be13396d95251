use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Days, Local, NaiveDate};
use log::{error, info};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    dedup::NotificationDeduper, error::MonitorResult, events::UsageResetSink,
    scheduler::CheckScheduler,
};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Time left until the next local midnight. Recomputed each day so DST
/// shifts land on the right instant.
pub fn delay_until_next_midnight(now: DateTime<Local>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest());

    match next {
        Some(next) => (next - now).to_std().unwrap_or(ONE_DAY),
        None => ONE_DAY,
    }
}

/// Retires notification flags and restarts the day once per local midnight.
pub struct DailyResetCoordinator {
    deduper: NotificationDeduper,
    sink: Arc<dyn UsageResetSink>,
    scheduler: CheckScheduler,
    retention_days: u32,
    armed: Mutex<Option<CancellationToken>>,
}

impl DailyResetCoordinator {
    pub fn new(
        deduper: NotificationDeduper,
        sink: Arc<dyn UsageResetSink>,
        scheduler: CheckScheduler,
        retention_days: u32,
    ) -> Self {
        Self {
            deduper,
            sink,
            scheduler,
            retention_days: retention_days.max(1),
            armed: Mutex::new(None),
        }
    }

    pub fn arm(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let previous = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        tokio::spawn(Arc::clone(self).run(token));
    }

    pub fn disarm(&self) {
        if let Some(token) = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
            info!("Daily reset disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// One reset for the day `today`, then restarts the regular cadence.
    /// Every step runs even when an earlier one fails; the first failure is
    /// returned.
    pub async fn fire(&self, today: NaiveDate) -> MonitorResult<()> {
        let outcome = self.retire_and_reset(today).await;
        self.scheduler.start_regular();
        outcome
    }

    /// Like `fire`, but the cadence stays off if `token` was disarmed while
    /// the reset ran.
    async fn fire_armed(&self, today: NaiveDate, token: &CancellationToken) -> MonitorResult<()> {
        let outcome = self.retire_and_reset(today).await;
        let _armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            info!("Monitoring stopped during the daily reset, regular checks stay off");
        } else {
            self.scheduler.start_regular();
        }
        outcome
    }

    async fn retire_and_reset(&self, today: NaiveDate) -> MonitorResult<()> {
        info!("Daily usage reset for {}", today);
        let mut outcome = Ok(());

        let cutoff = today
            .checked_sub_days(Days::new(u64::from(self.retention_days)))
            .unwrap_or(today);
        match self.deduper.retire_before(cutoff).await {
            Ok(purged) => info!("Retired {} notification flags before {}", purged, cutoff),
            Err(err) => {
                error!("Failed to retire notification flags: {}", err);
                outcome = Err(err);
            }
        }

        if let Err(err) = self.sink.reset() {
            error!("Failed to signal usage reset: {}", err);
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
        outcome
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut last_fired: Option<NaiveDate> = None;
        loop {
            let now = Local::now();
            let delay = delay_until_next_midnight(now);
            let target = (now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1)))
                .date_naive();
            info!("Next daily reset in {:?}", delay);

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }

            // Woken just short of midnight: that day was already reset.
            if last_fired.is_some_and(|last| last >= target) {
                continue;
            }
            last_fired = Some(target);
            if let Err(err) = self.fire_armed(target, &token).await {
                error!("Daily reset for {} incomplete, waiting for the next one: {}", target, err);
            }
        }
    }
}
