//! Host adapters: focus notifications, usage source and notification delivery.

use std::sync::Arc;

use crate::{
    db::DbHandler,
    detector::FocusSource,
    notification::NotificationDispatcher,
    usage::UsageQuery,
};

#[cfg(windows)]
pub mod windows;

/// OS focus notifications, where the host offers them.
pub fn focus_source() -> Option<Arc<dyn FocusSource>> {
    #[cfg(windows)]
    {
        Some(Arc::new(windows::WinEventFocusSource))
    }
    #[cfg(not(windows))]
    {
        None
    }
}

pub fn usage_source(db: Arc<DbHandler>) -> Arc<dyn UsageQuery> {
    #[cfg(windows)]
    {
        Arc::new(windows::ForegroundWindowUsage::new(db))
    }
    #[cfg(not(windows))]
    {
        db
    }
}

pub fn notification_dispatcher(app_id: &str) -> Arc<dyn NotificationDispatcher> {
    #[cfg(windows)]
    {
        Arc::new(windows::ToastDispatcher::new(app_id))
    }
    #[cfg(not(windows))]
    {
        log::debug!("No native notifier for {}, notifications go to the log", app_id);
        Arc::new(crate::notification::LogDispatcher)
    }
}
