use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use log::{debug, error, info, warn};
use rusqlite::{ffi::ErrorCode, params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::models::{from_sql_time, to_sql_time, UsagePeriod};
use crate::{
    dedup::{FlagKey, FlagStore},
    error::MonitorResult,
    events::MonitorEvent,
    models::{AppId, UsageSample},
    usage::{AppFilter, UsageQuery},
};

const MAX_RETRIES: u64 = 5;
const RETRY_DELAY_MS: u64 = 100;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS notification_flags (
        app TEXT NOT NULL,
        day TEXT NOT NULL,
        tier TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (app, day, tier)
    );
    CREATE TABLE IF NOT EXISTS app_usage_time_period (
        id TEXT PRIMARY KEY NOT NULL,
        app_name TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_app_usage_start ON app_usage_time_period (start_time);
"#;

const FLAG_INSERT_QUERY: &str = r#"
    INSERT OR IGNORE INTO notification_flags (app, day, tier, created_at)
    VALUES (?1, ?2, ?3, ?4)
"#;

const FLAG_EXISTS_QUERY: &str = r#"
    SELECT 1 FROM notification_flags WHERE app = ?1 AND day = ?2 AND tier = ?3
"#;

const CLOSE_OPEN_PERIOD_QUERY: &str = r#"
    UPDATE app_usage_time_period SET end_time = ?1
    WHERE end_time IS NULL AND start_time <= ?1
"#;

const PERIOD_INSERT_QUERY: &str = r#"
    INSERT INTO app_usage_time_period (id, app_name, start_time, end_time)
    VALUES (?1, ?2, ?3, NULL)
"#;

const PERIODS_IN_WINDOW_QUERY: &str = r#"
    SELECT id, app_name, start_time, end_time
    FROM app_usage_time_period
    WHERE start_time < :window_end
      AND (end_time IS NULL OR end_time > :window_start)
"#;

/// SQLite store for notification flags and recorded foreground periods.
pub struct DbHandler {
    conn: Arc<Mutex<Connection>>,
}

impl DbHandler {
    pub fn open(path: &Path) -> MonitorResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handler = Self::init(Connection::open(path)?)?;
        info!("Database opened at {:?}", path);
        Ok(handler)
    }

    pub fn open_in_memory() -> MonitorResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> MonitorResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `op`, retrying with a growing delay while the database is locked.
    async fn with_retry<T, F>(&self, op: F) -> rusqlite::Result<T>
    where
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        let mut attempts = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock().await;
                op(&mut conn)
            };
            match result {
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if matches!(err.code, ErrorCode::DatabaseLocked | ErrorCode::DatabaseBusy)
                        && attempts < MAX_RETRIES =>
                {
                    attempts += 1;
                    debug!("Database locked, retry {} of {}", attempts, MAX_RETRIES);
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * attempts)).await;
                }
                result => return result,
            }
        }
    }

    /// Closes the period of the previous foreground app and opens one for `app`.
    pub async fn record_foreground(&self, app: &AppId, at: DateTime<Local>) -> MonitorResult<()> {
        let app_name = app.to_string();
        let at = to_sql_time(at);
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            tx.execute(CLOSE_OPEN_PERIOD_QUERY, params![at])?;
            tx.execute(
                PERIOD_INSERT_QUERY,
                params![Uuid::new_v4().to_string(), app_name, at],
            )?;
            tx.commit()
        })
        .await?;
        debug!("Recorded foreground period start for {}", app);
        Ok(())
    }

    /// Ends whatever period is still open, e.g. on shutdown.
    pub async fn close_open_period(&self, at: DateTime<Local>) -> MonitorResult<usize> {
        let at = to_sql_time(at);
        Ok(self
            .with_retry(|conn| conn.execute(CLOSE_OPEN_PERIOD_QUERY, params![at]))
            .await?)
    }

    pub async fn periods_between(
        &self,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
    ) -> MonitorResult<Vec<UsagePeriod>> {
        let start = to_sql_time(window_start);
        let end = to_sql_time(window_end);
        let periods = self
            .with_retry(|conn| {
                let mut stmt = conn.prepare_cached(PERIODS_IN_WINDOW_QUERY)?;
                let rows = stmt.query_map(
                    &[(":window_start", start.as_str()), (":window_end", end.as_str())],
                    |row| {
                        let start_time: String = row.get(2)?;
                        let end_time: Option<String> = row.get(3)?;
                        Ok(UsagePeriod {
                            id: row.get(0)?,
                            app_name: AppId::new(row.get::<_, String>(1)?),
                            start_time: from_sql_time(2, &start_time)?,
                            end_time: end_time.as_deref().map(|t| from_sql_time(3, t)).transpose()?,
                        })
                    },
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(periods)
    }
}

#[async_trait]
impl FlagStore for DbHandler {
    async fn is_set(&self, key: &FlagKey) -> MonitorResult<bool> {
        let (app, day) = (key.app.to_string(), key.day.to_string());
        let found = self
            .with_retry(|conn| {
                conn.query_row(FLAG_EXISTS_QUERY, params![app, day, key.tier.as_str()], |_| Ok(()))
                    .optional()
            })
            .await?;
        Ok(found.is_some())
    }

    async fn set(&self, key: &FlagKey) -> MonitorResult<()> {
        self.try_set(key).await.map(|_| ())
    }

    async fn try_set(&self, key: &FlagKey) -> MonitorResult<bool> {
        let (app, day) = (key.app.to_string(), key.day.to_string());
        let inserted = self
            .with_retry(|conn| {
                conn.execute(
                    FLAG_INSERT_QUERY,
                    params![app, day, key.tier.as_str(), Local::now()],
                )
            })
            .await?;
        Ok(inserted == 1)
    }

    async fn purge_before(&self, day: NaiveDate) -> MonitorResult<usize> {
        let day = day.to_string();
        Ok(self
            .with_retry(|conn| conn.execute("DELETE FROM notification_flags WHERE day < ?1", params![day]))
            .await?)
    }
}

#[async_trait]
impl UsageQuery for DbHandler {
    async fn query(
        &self,
        filter: &AppFilter,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
    ) -> MonitorResult<Vec<UsageSample>> {
        let now = Local::now();
        let mut totals: HashMap<AppId, (i64, Option<DateTime<Local>>)> = HashMap::new();

        for period in self.periods_between(window_start, window_end).await? {
            if !filter.matches(&period.app_name) {
                continue;
            }
            let seconds = period.overlap_secs(window_start, window_end, now);
            let seen = period.last_seen(window_end, now);
            let entry = totals.entry(period.app_name).or_insert((0, None));
            entry.0 += seconds;
            entry.1 = entry.1.max(Some(seen));
        }

        let mut samples: Vec<UsageSample> = totals
            .into_iter()
            .map(|(app, (seconds, last_used))| UsageSample {
                app,
                window_start,
                window_end,
                foreground_minutes: u32::try_from(seconds / 60).unwrap_or(u32::MAX),
                last_used,
            })
            .collect();
        samples.sort_by(|a, b| a.app.as_str().cmp(b.app.as_str()));
        Ok(samples)
    }
}

/// Persists every foreground switch announced on the event bus.
pub async fn record_foreground_events(db: Arc<DbHandler>, mut rx: broadcast::Receiver<MonitorEvent>) {
    loop {
        match rx.recv().await {
            Ok(MonitorEvent::AppLaunched { app, at }) => {
                if let Err(err) = db.record_foreground(&app, at).await {
                    error!("Failed to record foreground period for {}: {}", app, err);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Usage recorder lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if let Err(err) = db.close_open_period(Local::now()).await {
        error!("Failed to close open usage period: {}", err);
    }
    info!("Usage recorder stopped");
}
