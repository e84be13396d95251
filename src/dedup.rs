use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use tokio::sync::Mutex;

use crate::{error::MonitorResult, models::AppId, threshold::Tier};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagKey {
    pub app: AppId,
    pub day: NaiveDate,
    pub tier: Tier,
}

impl FlagKey {
    pub fn new(app: &AppId, day: NaiveDate, tier: Tier) -> Self {
        Self {
            app: app.clone(),
            day,
            tier,
        }
    }
}

/// Durable "already notified" flags keyed by (app, day, tier).
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn is_set(&self, key: &FlagKey) -> MonitorResult<bool>;

    async fn set(&self, key: &FlagKey) -> MonitorResult<()>;

    /// Sets the flag only if it was absent. Returns `true` when this call set it.
    async fn try_set(&self, key: &FlagKey) -> MonitorResult<bool>;

    /// Drops flags for days strictly before `day`. Returns how many were dropped.
    async fn purge_before(&self, day: NaiveDate) -> MonitorResult<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    flags: Mutex<HashSet<FlagKey>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn is_set(&self, key: &FlagKey) -> MonitorResult<bool> {
        Ok(self.flags.lock().await.contains(key))
    }

    async fn set(&self, key: &FlagKey) -> MonitorResult<()> {
        self.flags.lock().await.insert(key.clone());
        Ok(())
    }

    async fn try_set(&self, key: &FlagKey) -> MonitorResult<bool> {
        Ok(self.flags.lock().await.insert(key.clone()))
    }

    async fn purge_before(&self, day: NaiveDate) -> MonitorResult<usize> {
        let mut flags = self.flags.lock().await;
        let before = flags.len();
        flags.retain(|key| key.day >= day);
        Ok(before - flags.len())
    }
}

/// Caps notifications to one per app, calendar day and tier.
#[derive(Clone)]
pub struct NotificationDeduper {
    store: Arc<dyn FlagStore>,
}

impl NotificationDeduper {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryFlagStore::new()))
    }

    pub async fn should_notify(&self, app: &AppId, day: NaiveDate, tier: Tier) -> MonitorResult<bool> {
        Ok(!self.store.is_set(&FlagKey::new(app, day, tier)).await?)
    }

    pub async fn mark_notified(&self, app: &AppId, day: NaiveDate, tier: Tier) -> MonitorResult<()> {
        self.store.set(&FlagKey::new(app, day, tier)).await
    }

    /// Atomic `should_notify` + `mark_notified`. Only one caller per key wins.
    pub async fn try_claim(&self, app: &AppId, day: NaiveDate, tier: Tier) -> MonitorResult<bool> {
        let claimed = self.store.try_set(&FlagKey::new(app, day, tier)).await?;
        if !claimed {
            debug!("{} already notified for {} on {}", app, tier.as_str(), day);
        }
        Ok(claimed)
    }

    pub async fn retire_before(&self, day: NaiveDate) -> MonitorResult<usize> {
        self.store.purge_before(day).await
    }
}
