use std::{io::Write, path::Path};

use chrono::Local;
use env_logger::Builder;
use log::info;

use crate::error::MonitorResult;

pub struct Logger;

impl Logger {
    /// Debug builds log to the console; release builds append to `log_path`.
    pub fn initialize(log_path: &Path) -> MonitorResult<()> {
        let mut binding = Builder::from_default_env();
        let builder = binding.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        });

        #[cfg(debug_assertions)]
        {
            let _ = log_path;
            builder.filter(None, log::LevelFilter::Debug).init();
            info!("Debug mode: Logging to console.");
        }

        #[cfg(not(debug_assertions))]
        {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?;
            builder
                .target(env_logger::Target::Pipe(Box::new(log_file)))
                .filter(None, log::LevelFilter::Info)
                .init();
            info!("Release mode: Logging to file at {:?}", log_path);
        }

        Ok(())
    }
}
