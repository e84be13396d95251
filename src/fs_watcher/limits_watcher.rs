use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{error, info, warn};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::{
    fs,
    sync::{mpsc, RwLock},
};

use crate::{
    error::MonitorResult,
    models::{AppId, UsageLimit},
};

#[derive(Debug, Deserialize)]
struct LimitEntry {
    app: AppId,
    limit_minutes: u32,
    #[serde(default)]
    display_name: Option<String>,
}

/// The limits currently in force, shared between the watcher and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct LimitRegistry {
    limits: Arc<RwLock<Vec<UsageLimit>>>,
}

impl LimitRegistry {
    pub fn new(limits: Vec<UsageLimit>) -> Self {
        Self {
            limits: Arc::new(RwLock::new(limits)),
        }
    }

    pub async fn snapshot(&self) -> Vec<UsageLimit> {
        self.limits.read().await.clone()
    }

    pub async fn get(&self, app: &AppId) -> Option<UsageLimit> {
        self.limits
            .read()
            .await
            .iter()
            .find(|limit| &limit.app == app)
            .cloned()
    }

    pub async fn replace(&self, limits: Vec<UsageLimit>) {
        *self.limits.write().await = limits;
    }
}

/// Parses the limits document. Entries with a zero limit or a repeated app
/// are logged and skipped; the rest are kept.
pub fn parse_limits(json: &str) -> MonitorResult<Vec<UsageLimit>> {
    let entries: Vec<LimitEntry> = serde_json::from_str(json)?;
    let mut seen = HashSet::new();
    let mut limits = Vec::with_capacity(entries.len());

    for entry in entries {
        if !seen.insert(entry.app.clone()) {
            warn!("Duplicate limit for {}, keeping the first one", entry.app);
            continue;
        }
        let display_name = entry
            .display_name
            .unwrap_or_else(|| entry.app.to_string());
        match UsageLimit::new(entry.app, entry.limit_minutes, display_name) {
            Ok(limit) => limits.push(limit),
            Err(err) => error!("Skipping limit: {}", err),
        }
    }
    Ok(limits)
}

/// Reads the limits file, creating an empty one when it does not exist.
pub async fn load_limits(path: &Path) -> MonitorResult<Vec<UsageLimit>> {
    match fs::read_to_string(path).await {
        Ok(json) => parse_limits(&json),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(path, "[]").await?;
            info!("Created empty limits file at {:?}", path);
            Ok(Vec::new())
        }
        Err(err) => Err(err.into()),
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|changed| changed.file_name() == path.file_name())
}

/// Reloads `registry` whenever the limits file changes. A file that fails to
/// parse leaves the previous limits in place.
pub async fn watch_limits(path: PathBuf, registry: LimitRegistry) -> MonitorResult<()> {
    let (sender, mut receiver) = mpsc::channel(1);
    let watched = path.clone();

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) if touches(&event, &watched) => {
                // A full channel already has a reload queued.
                let _ = sender.try_send(());
            }
            Ok(_) => {}
            Err(e) => error!("Watch error: {:?}", e),
        },
        Config::default(),
    )?;

    // Editors often replace the file, so watch the directory holding it.
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!("Watching limits file {:?}", path);

    while receiver.recv().await.is_some() {
        match load_limits(&path).await {
            Ok(limits) => {
                info!("Reloaded {} limits", limits.len());
                registry.replace(limits).await;
            }
            Err(err) => error!("Failed to reload limits file: {}. Keeping previous limits.", err),
        }
    }
    Ok(())
}
