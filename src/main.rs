use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use dotenvy::dotenv;
use log::{error, info};

use app_limit_monitor::{
    config::Config,
    db::{record_foreground_events, DbHandler},
    detector::{EventDrivenDetector, ForegroundDetector, PollingDetector},
    events::EventBus,
    fs_watcher::{load_limits, open_or_create_file, watch_limits, LimitRegistry},
    logger::Logger,
    platform,
    zero_mq_service::{ControlListener, Publisher},
    Monitor, MonitorDeps,
};

const NOTIFIER_APP_ID: &str = "com.app-limit-monitor.app";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = Config::new().context("Failed to resolve configuration")?;
    Logger::initialize(&config.log_path).context("Failed to initialize logging")?;
    info!("Starting app limit monitor, session {}", config.session_id);

    let monitor_config = open_or_create_file(&config.monitor_config_path).await;
    let db = Arc::new(DbHandler::open(&config.db_path).context("Failed to open database")?);
    let limits = LimitRegistry::new(load_limits(&config.limits_path).await.unwrap_or_else(|err| {
        error!("Failed to load limits file: {}. Starting without limits.", err);
        Vec::new()
    }));
    let bus = EventBus::default();
    let usage = platform::usage_source(Arc::clone(&db));

    let monitor = Arc::new(Monitor::new(
        MonitorDeps {
            usage: Arc::clone(&usage),
            flags: db.clone(),
            dispatcher: platform::notification_dispatcher(NOTIFIER_APP_ID),
            limits: limits.clone(),
            bus: bus.clone(),
        },
        &monitor_config,
    ));

    tokio::spawn(record_foreground_events(db.clone(), bus.subscribe()));

    match Publisher::bind(&config.events_endpoint).await {
        Ok(publisher) => {
            tokio::spawn(publisher.forward(bus.subscribe()));
        }
        Err(e) => error!("Unable to bind event publisher: {}", e),
    }
    match ControlListener::connect(&config.control_endpoint).await {
        Ok(listener) => {
            tokio::spawn(listener.serve(Arc::clone(&monitor)));
        }
        Err(e) => error!("Unable to connect control listener: {}", e),
    }

    let limits_path = config.limits_path.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_limits(limits_path, limits).await {
            error!("Limits file will not be reloaded: {}", e);
        }
    });

    let mut detectors: Vec<Arc<dyn ForegroundDetector>> = vec![Arc::new(
        PollingDetector::new(usage, monitor.authority().clone())
            .with_timing(monitor_config.poll_interval(), monitor_config.poll_window()),
    )];
    if let Some(source) = platform::focus_source() {
        detectors.push(Arc::new(EventDrivenDetector::new(
            source,
            monitor.authority().clone(),
            config.self_app.clone(),
        )));
    }
    let detection = monitor.run_detectors(detectors);

    if let Err(e) = monitor.start_monitoring().await {
        error!("Unable to start monitoring: {}", e);
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Shutdown signal received.");
        }
        _ = detection => error!("Foreground detection ended unexpectedly"),
    }

    monitor.stop_monitoring();
    if let Err(e) = db.close_open_period(Local::now()).await {
        error!("Failed to close open usage period: {}", e);
    }
    info!("App limit monitor stopped");
    Ok(())
}
