pub mod config;
pub mod db;
pub mod dedup;
pub mod detector;
pub mod error;
pub mod events;
pub mod fs_watcher;
pub mod logger;
pub mod models;
pub mod monitor;
pub mod notification;
pub mod platform;
pub mod reset;
pub mod scheduler;
pub mod threshold;
pub mod usage;
pub mod zero_mq_service;

#[cfg(test)]
mod testing;

pub use error::{MonitorError, MonitorResult};
pub use monitor::{ControlCommand, Monitor, MonitorDeps};
