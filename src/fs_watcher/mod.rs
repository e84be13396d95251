mod config_visitor;
pub mod config_watcher;
pub mod limits_watcher;

pub use config_watcher::{open_or_create_file, MonitorConfig};
pub use limits_watcher::{load_limits, parse_limits, watch_limits, LimitRegistry};
