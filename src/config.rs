use std::{
    env,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::{error::MonitorResult, models::AppId};

const DEFAULT_DATABASE_URL: &str = "%AppData%\\app_limit_monitor\\app_limit_monitor.sqlite3";
const DEFAULT_LIMITS_PATH: &str = "%AppData%\\app_limit_monitor\\limits.json";
const DEFAULT_MONITOR_CONFIG_PATH: &str = "%AppData%\\app_limit_monitor\\monitor_config.json";
const DEFAULT_EVENTS_ENDPOINT: &str = "tcp://127.0.0.1:30002";
const DEFAULT_CONTROL_ENDPOINT: &str = "tcp://127.0.0.1:30003";
const DEFAULT_APP_ID: &str = "app_limit_monitor.exe";

#[derive(Debug, Clone)]
pub struct Config {
    pub session_id: String,
    pub db_path: PathBuf,
    pub log_path: PathBuf,
    pub limits_path: PathBuf,
    pub monitor_config_path: PathBuf,
    pub events_endpoint: String,
    pub control_endpoint: String,
    pub self_app: AppId,
}

impl Config {
    pub fn new() -> MonitorResult<Self> {
        let db_path = resolve_path("DATABASE_URL", DEFAULT_DATABASE_URL);
        let log_path = db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("application.log");

        Ok(Config {
            session_id: Uuid::new_v4().to_string(),
            db_path,
            log_path,
            limits_path: resolve_path("LIMITS_PATH", DEFAULT_LIMITS_PATH),
            monitor_config_path: resolve_path("MONITOR_CONFIG_PATH", DEFAULT_MONITOR_CONFIG_PATH),
            events_endpoint: env::var("EVENTS_ENDPOINT").unwrap_or(DEFAULT_EVENTS_ENDPOINT.to_owned()),
            control_endpoint: env::var("CONTROL_ENDPOINT")
                .unwrap_or(DEFAULT_CONTROL_ENDPOINT.to_owned()),
            self_app: self_app_id()?,
        })
    }
}

fn resolve_path(var: &str, default: &str) -> PathBuf {
    expand_app_data(&env::var(var).unwrap_or(default.to_owned()))
}

/// Replaces `%AppData%` with the user's config directory.
pub fn expand_app_data(raw: &str) -> PathBuf {
    if raw.contains("%AppData%") {
        let app_data_path = dirs::config_dir().unwrap_or_else(|| Path::new(".").to_path_buf());
        PathBuf::from(raw.replace("%AppData%", &app_data_path.to_string_lossy()))
    } else {
        PathBuf::from(raw)
    }
}

/// The monitor's own app id, so it never reports itself as the foreground app.
fn self_app_id() -> MonitorResult<AppId> {
    if let Ok(id) = env::var("MONITOR_APP_ID") {
        return Ok(AppId::new(id));
    }
    let exe = env::current_exe()?;
    Ok(exe
        .file_name()
        .map(|name| AppId::new(name.to_string_lossy()))
        .unwrap_or_else(|| AppId::new(DEFAULT_APP_ID)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_paths_untouched() {
        assert_eq!(
            expand_app_data("/var/lib/monitor/limits.json"),
            PathBuf::from("/var/lib/monitor/limits.json")
        );
    }

    #[test]
    fn test_app_data_expanded() {
        let path = expand_app_data("%AppData%/app_limit_monitor/limits.json");
        assert!(!path.to_string_lossy().contains("%AppData%"));
        assert!(path.ends_with("app_limit_monitor/limits.json"));
    }
}
