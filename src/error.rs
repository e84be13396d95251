use thiserror::Error;

use crate::models::AppId;

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("limit for {app} must be a positive number of minutes, got {limit_minutes}")]
    InvalidLimit { app: AppId, limit_minutes: u32 },

    #[error("usage access has not been granted")]
    UsageAccessDenied,

    #[error("unable to query usage: {0}")]
    UsageQuery(String),

    #[error("unable to reach data store")]
    Store(#[from] rusqlite::Error),

    #[error("unable to deliver notification: {0}")]
    Dispatch(String),

    #[error("unable to publish event: {0}")]
    Transport(String),

    #[error("invalid configuration")]
    Config(#[from] serde_json::Error),

    #[error("unable to watch file")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Transient failures are retried on the next natural occurrence; the
    /// rest are reported once and dropped.
    pub fn is_transient(&self) -> bool {
        match self {
            MonitorError::UsageQuery(_)
            | MonitorError::Store(_)
            | MonitorError::Dispatch(_)
            | MonitorError::Transport(_)
            | MonitorError::Io(_) => true,
            MonitorError::InvalidLimit { .. }
            | MonitorError::UsageAccessDenied
            | MonitorError::Config(_)
            | MonitorError::Watch(_) => false,
        }
    }
}

impl serde::Serialize for MonitorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}
