use std::{io::ErrorKind, path::Path, time::Duration};

use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};

use super::config_visitor::MonitorConfigVisitor;
use crate::{error::MonitorResult, scheduler::RecheckPolicy};

/// Tuning knobs of the monitor, read from `monitor_config.json`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub regular_interval_minutes: u64,
    pub flex_minutes: u64,
    pub poll_interval_ms: u64,
    pub poll_window_secs: u64,
    pub near_recheck_minutes: u64,
    pub approaching_recheck_minutes: u64,
    pub flag_retention_days: u32,
}

impl<'de> Deserialize<'de> for MonitorConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_struct(
            "MonitorConfig",
            &[
                "regular_interval_minutes",
                "flex_minutes",
                "poll_interval_ms",
                "poll_window_secs",
                "near_recheck_minutes",
                "approaching_recheck_minutes",
                "flag_retention_days",
            ],
            MonitorConfigVisitor,
        )
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            regular_interval_minutes: 20,
            flex_minutes: 5,
            poll_interval_ms: 1000,
            poll_window_secs: 10,
            near_recheck_minutes: 2,
            approaching_recheck_minutes: 5,
            flag_retention_days: 2,
        }
    }
}

impl MonitorConfig {
    pub fn regular_interval(&self) -> Duration {
        Duration::from_secs(self.regular_interval_minutes * 60)
    }

    pub fn flex(&self) -> Duration {
        Duration::from_secs(self.flex_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_window(&self) -> Duration {
        Duration::from_secs(self.poll_window_secs)
    }

    pub fn recheck_policy(&self) -> RecheckPolicy {
        RecheckPolicy {
            near: Duration::from_secs(self.near_recheck_minutes * 60),
            approaching: Duration::from_secs(self.approaching_recheck_minutes * 60),
        }
    }
}

async fn create_default(config_path: &Path) -> MonitorResult<MonitorConfig> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut config_file = File::create(config_path).await?;
    let default_config = MonitorConfig::default();
    let default_config_string = serde_json::to_string_pretty(&default_config)?;
    config_file
        .write_all(default_config_string.as_bytes())
        .await?;
    Ok(default_config)
}

/// Reads the config file, creating it with defaults when missing. Any other
/// failure falls back to the defaults.
pub async fn open_or_create_file(config_path: &Path) -> MonitorConfig {
    let mut json_string = String::new();

    match File::open(config_path).await {
        Ok(mut file) => {
            if let Err(err) = file.read_to_string(&mut json_string).await {
                error!("Failed to read config file: {}. Using default.", err);
                return MonitorConfig::default();
            }

            match serde_json::from_str(&json_string) {
                Ok(config) => config,
                Err(err) => {
                    error!("Failed to parse config file: {}. Using default.", err);
                    MonitorConfig::default()
                }
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound => match create_default(config_path).await {
            Ok(config) => {
                info!("Created default monitor config at {:?}", config_path);
                config
            }
            Err(err) => {
                error!("Failed to create new config file: {}. Using default.", err);
                MonitorConfig::default()
            }
        },
        Err(err) => {
            error!(
                "Unexpected error opening config file: {}. Using default.",
                err
            );
            MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_config_deserialization() {
        let json_data = r#"
        {
            "regular_interval_minutes": 30,
            "flex_minutes": 10,
            "poll_interval_ms": 500,
            "poll_window_secs": 15,
            "near_recheck_minutes": 3,
            "approaching_recheck_minutes": 7,
            "flag_retention_days": 4
        }
        "#;

        let config: MonitorConfig = serde_json::from_str(json_data).expect("Failed to deserialize");

        assert_eq!(config.regular_interval(), Duration::from_secs(1800));
        assert_eq!(config.flex(), Duration::from_secs(600));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.poll_window(), Duration::from_secs(15));
        assert_eq!(config.recheck_policy().near, Duration::from_secs(180));
        assert_eq!(config.recheck_policy().approaching, Duration::from_secs(420));
        assert_eq!(config.flag_retention_days, 4);
    }

    #[test]
    fn test_clamping_behavior() {
        let json_data = r#"
        {
            "regular_interval_minutes": 1,
            "flex_minutes": 60,
            "poll_interval_ms": 50000,
            "poll_window_secs": 0,
            "near_recheck_minutes": 0,
            "approaching_recheck_minutes": 500,
            "flag_retention_days": 90
        }
        "#;

        let config: MonitorConfig = serde_json::from_str(json_data).expect("Failed to deserialize");

        assert_eq!(config.regular_interval_minutes, 5);
        assert_eq!(config.flex_minutes, 5); // capped at the interval
        assert_eq!(config.poll_interval_ms, 10_000);
        assert_eq!(config.poll_window_secs, 2);
        assert_eq!(config.near_recheck_minutes, 1);
        assert_eq!(config.approaching_recheck_minutes, 60);
        assert_eq!(config.flag_retention_days, 30);
    }

    #[test]
    fn test_missing_field_error() {
        let result: Result<MonitorConfig, _> =
            serde_json::from_str(r#"{ "regular_interval_minutes": 20 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_round_trip_through_visitor() {
        let json = serde_json::to_string(&MonitorConfig::default()).unwrap();
        let config: MonitorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.recheck_policy(), RecheckPolicy::default());
    }

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = std::env::temp_dir().join(format!("alm-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("monitor_config.json");

        let config = open_or_create_file(&path).await;
        assert_eq!(config, MonitorConfig::default());
        assert!(path.exists());

        tokio::fs::write(&path, "not json").await.unwrap();
        assert_eq!(open_or_create_file(&path).await, MonitorConfig::default());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
