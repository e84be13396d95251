use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use super::{ForegroundDetector, ForegroundSender, ModeAuthority, MonitoringMode};
use crate::{
    models::{AppId, ForegroundEvent},
    usage::{AppFilter, UsageQuery},
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const POLL_WINDOW: Duration = Duration::from_secs(10);

struct PollState {
    last_emitted: Option<AppId>,
    modes: watch::Receiver<MonitoringMode>,
}

/// Fallback detector: asks the usage query which app was used last.
pub struct PollingDetector {
    usage: Arc<dyn UsageQuery>,
    authority: ModeAuthority,
    period: Duration,
    window: Duration,
    state: Mutex<PollState>,
}

impl PollingDetector {
    pub fn new(usage: Arc<dyn UsageQuery>, authority: ModeAuthority) -> Self {
        let modes = authority.subscribe();
        Self {
            usage,
            authority,
            period: POLL_INTERVAL,
            window: POLL_WINDOW,
            state: Mutex::new(PollState {
                last_emitted: None,
                modes,
            }),
        }
    }

    pub fn with_timing(mut self, period: Duration, window: Duration) -> Self {
        self.period = period;
        self.window = window;
        self
    }

    /// One poll. Query failures yield no event and are retried next tick.
    pub async fn poll_once(&self, now: DateTime<Local>) -> Option<ForegroundEvent> {
        {
            let mut state = self.state.lock().await;
            // Another source may have reported other apps since our last event.
            if state.modes.has_changed().unwrap_or(false) {
                state.modes.borrow_and_update();
                state.last_emitted = None;
            }
        }
        if !self.authority.is_authoritative(MonitoringMode::Polling) {
            return None;
        }

        let window = chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::seconds(10));
        let window_start = now - window;
        let samples = match self.usage.query(&AppFilter::All, window_start, now).await {
            Ok(samples) => samples,
            Err(err) => {
                warn!("Error getting foreground app: {}", err);
                return None;
            }
        };

        let (at, app) = samples
            .into_iter()
            .filter_map(|sample| {
                sample
                    .last_used
                    .filter(|used| *used >= window_start && *used <= now)
                    .map(|used| (used, sample.app))
            })
            .max_by_key(|(used, _)| *used)?;

        let mut state = self.state.lock().await;
        if state.last_emitted.as_ref() == Some(&app) {
            return None;
        }
        state.last_emitted = Some(app.clone());
        Some(ForegroundEvent::new(app, at))
    }

    async fn run(self: Arc<Self>, sink: ForegroundSender) {
        info!("Polling foreground detection started, every {:?}", self.period);
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sink.closed() => break,
                _ = interval.tick() => {
                    if let Some(event) = self.poll_once(Local::now()).await {
                        debug!("App changed: {}", event.app);
                        if sink.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("Polling foreground detection stopped");
    }
}

impl ForegroundDetector for PollingDetector {
    fn mode(&self) -> MonitoringMode {
        MonitoringMode::Polling
    }

    fn spawn(self: Arc<Self>, sink: ForegroundSender) -> JoinHandle<()> {
        tokio::spawn(self.run(sink))
    }
}
