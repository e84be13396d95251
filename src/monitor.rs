use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    dedup::{FlagStore, NotificationDeduper},
    detector::{self, ForegroundDetector, ModeAuthority, MonitoringMode},
    error::{MonitorError, MonitorResult},
    events::{EventBus, MonitorEvent},
    fs_watcher::{LimitRegistry, MonitorConfig},
    models::{AppId, UsageLimit},
    notification::NotificationDispatcher,
    reset::DailyResetCoordinator,
    scheduler::{Cadence, CheckScheduler, UsageChecker},
    usage::UsageQuery,
};

/// Commands accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    StartMonitoring,
    StopMonitoring,
    CheckApp {
        app: AppId,
        limit_minutes: u32,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        delay_minutes: u64,
    },
    CancelChecks {
        app: AppId,
    },
}

/// Collaborators the monitor is built from.
pub struct MonitorDeps {
    pub usage: Arc<dyn UsageQuery>,
    pub flags: Arc<dyn FlagStore>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub limits: LimitRegistry,
    pub bus: EventBus,
}

/// Control surface of the usage monitor.
pub struct Monitor {
    usage: Arc<dyn UsageQuery>,
    scheduler: CheckScheduler,
    reset: Arc<DailyResetCoordinator>,
    authority: ModeAuthority,
    bus: EventBus,
    current: Arc<watch::Sender<Option<AppId>>>,
    mode_relay: AtomicBool,
}

impl Monitor {
    pub fn new(deps: MonitorDeps, config: &MonitorConfig) -> Self {
        let deduper = NotificationDeduper::new(deps.flags);
        let checker = Arc::new(UsageChecker::new(
            Arc::clone(&deps.usage),
            deduper.clone(),
            deps.dispatcher,
            Arc::new(deps.bus.clone()),
            config.recheck_policy(),
        ));
        let cadence = Cadence::new(config.regular_interval(), config.flex());
        let scheduler = CheckScheduler::new(checker, deps.limits, deps.bus.clone(), cadence);
        let reset = Arc::new(DailyResetCoordinator::new(
            deduper,
            Arc::new(deps.bus.clone()),
            scheduler.clone(),
            config.flag_retention_days,
        ));
        let (current, _) = watch::channel(None);

        Self {
            usage: deps.usage,
            scheduler,
            reset,
            authority: ModeAuthority::new(),
            bus: deps.bus,
            current: Arc::new(current),
            mode_relay: AtomicBool::new(false),
        }
    }

    pub fn authority(&self) -> &ModeAuthority {
        &self.authority
    }

    pub fn scheduler(&self) -> &CheckScheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn has_usage_access(&self) -> bool {
        self.usage.is_available().await
    }

    /// Starts the regular cadence and the daily reset. Refused without usage access.
    pub async fn start_monitoring(&self) -> MonitorResult<()> {
        if !self.has_usage_access().await {
            return Err(MonitorError::UsageAccessDenied);
        }
        self.scheduler.start_regular();
        self.reset.arm();
        info!("Monitoring started");
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        // Disarm first: a reset already firing must not restart the cadence.
        self.reset.disarm();
        self.scheduler.stop();
        info!("Monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Schedules an intensive check of `app` after `delay`. A zero limit is rejected.
    pub fn check_app(
        &self,
        app: AppId,
        limit_minutes: u32,
        display_name: impl Into<String>,
        delay: Duration,
    ) -> MonitorResult<Uuid> {
        let limit = UsageLimit::new(app, limit_minutes, display_name)?;
        Ok(self.scheduler.schedule_intensive(limit, delay))
    }

    pub fn cancel_checks(&self, app: &AppId) -> bool {
        self.scheduler.cancel_checks(app)
    }

    pub fn current_app(&self) -> Option<AppId> {
        self.current.borrow().clone()
    }

    pub fn mode(&self) -> MonitoringMode {
        self.authority.current()
    }

    pub async fn apply(&self, command: ControlCommand) -> MonitorResult<()> {
        debug!("Control command: {:?}", command);
        match command {
            ControlCommand::StartMonitoring => self.start_monitoring().await,
            ControlCommand::StopMonitoring => {
                self.stop_monitoring();
                Ok(())
            }
            ControlCommand::CheckApp {
                app,
                limit_minutes,
                display_name,
                delay_minutes,
            } => {
                let display_name = display_name.unwrap_or_else(|| app.to_string());
                let delay = Duration::from_secs(delay_minutes.saturating_mul(60));
                self.check_app(app, limit_minutes, display_name, delay)
                    .map(|_| ())
            }
            ControlCommand::CancelChecks { app } => {
                self.cancel_checks(&app);
                Ok(())
            }
        }
    }

    /// Runs `detectors` into one stream. Every switch to a different app is
    /// published as `AppLaunched`; mode flips are published as `ModeChanged`.
    /// The returned task ends once every detector has stopped.
    pub fn run_detectors(&self, detectors: Vec<Arc<dyn ForegroundDetector>>) -> JoinHandle<()> {
        // One relay per monitor, however often detection is restarted.
        if !self.mode_relay.swap(true, Ordering::SeqCst) {
            let mut modes = self.authority.subscribe();
            let bus = self.bus.clone();
            tokio::spawn(async move {
                while modes.changed().await.is_ok() {
                    let mode = *modes.borrow_and_update();
                    bus.publish(MonitorEvent::ModeChanged { mode });
                }
            });
        }

        let (sender, receiver) = detector::channel();
        for detector in detectors {
            debug!("Starting {:?} detector", detector.mode());
            detector.spawn(sender.clone());
        }
        drop(sender);

        let bus = self.bus.clone();
        let current = Arc::clone(&self.current);
        tokio::spawn(async move {
            let mut events = Box::pin(detector::event_stream(receiver));
            while let Some(event) = events.next().await {
                let changed = current.send_if_modified(|app| {
                    if app.as_ref() == Some(&event.app) {
                        false
                    } else {
                        *app = Some(event.app.clone());
                        true
                    }
                });
                if changed {
                    info!("Foreground app: {}", event.app);
                    bus.publish(MonitorEvent::AppLaunched {
                        app: event.app,
                        at: event.at,
                    });
                }
            }
            info!("Foreground detection ended");
        })
    }
}
