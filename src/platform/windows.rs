// Standard library
use std::{cell::RefCell, ffi::OsString, os::windows::prelude::*, path::Path, sync::Arc};

// External crates
use async_trait::async_trait;
use chrono::{DateTime, Local};
use log::{debug, error, info};
use tokio::sync::mpsc;

// Windows APIs
use windows::{
    core::HSTRING,
    Data::Xml::Dom::XmlDocument,
    Win32::{
        Foundation::{CloseHandle, FALSE, HINSTANCE, HMODULE, HWND},
        System::{
            Com::CoInitialize,
            ProcessStatus::GetModuleFileNameExW,
            Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ},
        },
        UI::{
            Accessibility::{SetWinEventHook, UnhookWinEvent, HWINEVENTHOOK},
            WindowsAndMessaging::{
                DispatchMessageW, GetForegroundWindow, GetMessageW, GetWindowThreadProcessId,
                PostQuitMessage, TranslateMessage, EVENT_SYSTEM_FOREGROUND, MSG,
                WINEVENT_OUTOFCONTEXT, WINEVENT_SKIPOWNPROCESS,
            },
        },
    },
    UI::Notifications::{ToastNotification, ToastNotificationManager},
};

use crate::{
    db::DbHandler,
    detector::{FocusSignal, FocusSource},
    error::{MonitorError, MonitorResult},
    models::{AppId, UsageSample},
    notification::{LimitNotification, NotificationDispatcher, Urgency},
    usage::{AppFilter, UsageQuery},
};

const TOAST_GROUP: &str = "app-limits";

thread_local! {
    static FOCUS_SINK: RefCell<Option<mpsc::UnboundedSender<FocusSignal>>> = const { RefCell::new(None) };
}

fn get_process_path(window: HWND) -> Option<String> {
    let mut process_id = 0;
    unsafe { GetWindowThreadProcessId(window, Some(&mut process_id)) };

    let handle = unsafe {
        OpenProcess(
            PROCESS_QUERY_INFORMATION | PROCESS_VM_READ,
            FALSE,
            process_id,
        )
    }
    .map_err(|e| debug!("OpenProcess failed: {:?}", e))
    .ok()?;
    let mut buffer = [0u16; 260];
    let len = unsafe { GetModuleFileNameExW(handle, HINSTANCE::default(), &mut buffer) };
    unsafe {
        if CloseHandle(handle).is_err() {
            error!("Unable to close the process handle")
        }
    };

    if len == 0 {
        return None;
    }
    Some(
        OsString::from_wide(&buffer[..len as usize])
            .to_string_lossy()
            .into_owned(),
    )
}

/// Executable file name of the process owning `window`, e.g. `chrome.exe`.
fn app_for_window(window: HWND) -> Option<AppId> {
    if window.0.is_null() {
        return None;
    }
    let path = get_process_path(window)?;
    Path::new(&path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(AppId::new)
}

pub fn current_foreground_app() -> Option<AppId> {
    app_for_window(unsafe { GetForegroundWindow() })
}

fn emit(signal: FocusSignal) {
    FOCUS_SINK.with(|sink| {
        let closed = sink
            .borrow()
            .as_ref()
            .map_or(true, |sender| sender.send(signal).is_err());
        if closed {
            // Nobody listens anymore: leave the message loop.
            unsafe { PostQuitMessage(0) };
        }
    });
}

unsafe extern "system" fn on_foreground(
    _hook: HWINEVENTHOOK,
    _event: u32,
    window: HWND,
    _id_object: i32,
    _id_child: i32,
    _event_thread: u32,
    _event_time: u32,
) {
    if let Some(app) = app_for_window(window) {
        emit(FocusSignal::Focused {
            app,
            at: Local::now(),
        });
    }
}

/// Foreground changes from `SetWinEventHook(EVENT_SYSTEM_FOREGROUND)`, served
/// by a dedicated thread running a message loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinEventFocusSource;

impl WinEventFocusSource {
    fn run_hook(sender: mpsc::UnboundedSender<FocusSignal>) {
        let hook = unsafe {
            SetWinEventHook(
                EVENT_SYSTEM_FOREGROUND,
                EVENT_SYSTEM_FOREGROUND,
                HMODULE::default(),
                Some(on_foreground),
                0,
                0,
                WINEVENT_OUTOFCONTEXT | WINEVENT_SKIPOWNPROCESS,
            )
        };
        if hook.is_invalid() {
            error!("SetWinEventHook failed, staying on polling detection");
            return;
        }

        let _ = sender.send(FocusSignal::Connected);
        if let Some(app) = current_foreground_app() {
            let _ = sender.send(FocusSignal::Focused {
                app,
                at: Local::now(),
            });
        }
        FOCUS_SINK.with(|sink| *sink.borrow_mut() = Some(sender.clone()));
        info!("Foreground hook installed");

        let mut msg = MSG::default();
        unsafe {
            while GetMessageW(&mut msg, HWND::default(), 0, 0).as_bool() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
            if !UnhookWinEvent(hook).as_bool() {
                error!("Unable to remove foreground hook");
            }
        }

        FOCUS_SINK.with(|sink| sink.borrow_mut().take());
        let _ = sender.send(FocusSignal::Disconnected);
        info!("Foreground hook removed");
    }
}

impl FocusSource for WinEventFocusSource {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<FocusSignal> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Err(err) = std::thread::Builder::new()
            .name("foreground-hook".into())
            .spawn(move || Self::run_hook(sender))
        {
            error!("Unable to start foreground hook thread: {}", err);
        }
        receiver
    }
}

/// Recorded usage plus whatever window is in the foreground right now, so
/// polling still finds the current app when no hook records switches.
pub struct ForegroundWindowUsage {
    db: Arc<DbHandler>,
}

impl ForegroundWindowUsage {
    pub fn new(db: Arc<DbHandler>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UsageQuery for ForegroundWindowUsage {
    async fn query(
        &self,
        filter: &AppFilter,
        window_start: DateTime<Local>,
        window_end: DateTime<Local>,
    ) -> MonitorResult<Vec<UsageSample>> {
        let mut samples = self.db.query(filter, window_start, window_end).await?;
        let now = Local::now();
        if window_end < now - chrono::Duration::seconds(2) {
            return Ok(samples);
        }

        if let Some(app) = current_foreground_app().filter(|app| filter.matches(app)) {
            let seen = now.min(window_end);
            match samples.iter_mut().find(|sample| sample.app == app) {
                Some(sample) => sample.last_used = sample.last_used.max(Some(seen)),
                None => samples.push(UsageSample {
                    app,
                    window_start,
                    window_end,
                    foreground_minutes: 0,
                    last_used: Some(seen),
                }),
            }
        }
        Ok(samples)
    }
}

fn toast_xml(notification: &LimitNotification) -> windows::core::Result<XmlDocument> {
    let toast_xml = XmlDocument::new()?;

    let toast_element = toast_xml.CreateElement(&HSTRING::from("toast"))?;
    let visual_element = toast_xml.CreateElement(&HSTRING::from("visual"))?;
    let binding_element = toast_xml.CreateElement(&HSTRING::from("binding"))?;
    binding_element.SetAttribute(&HSTRING::from("template"), &HSTRING::from("ToastGeneric"))?;

    for line in [notification.title().to_string(), notification.body()] {
        let text = toast_xml.CreateElement(&HSTRING::from("text"))?;
        text.AppendChild(&toast_xml.CreateTextNode(&HSTRING::from(line))?)?;
        binding_element.AppendChild(&text)?;
    }
    visual_element.AppendChild(&binding_element)?;

    let sound = match notification.urgency() {
        Urgency::Normal => "ms-winsoundevent:Notification.Default",
        Urgency::High => "ms-winsoundevent:Notification.Reminder",
    };
    let audio_element = toast_xml.CreateElement(&HSTRING::from("audio"))?;
    audio_element.SetAttribute(&HSTRING::from("src"), &HSTRING::from(sound))?;

    toast_element.AppendChild(&visual_element)?;
    toast_element.AppendChild(&audio_element)?;
    toast_xml.AppendChild(&toast_element)?;

    Ok(toast_xml)
}

fn show_toast(app_id: &str, notification: &LimitNotification) -> windows::core::Result<()> {
    unsafe {
        _ = CoInitialize(None);
    }
    let notifier = ToastNotificationManager::CreateToastNotifierWithId(&HSTRING::from(app_id))?;
    let toast = ToastNotification::CreateToastNotification(&toast_xml(notification)?)?;
    // Same tag per app: a newer warning replaces the one still on screen.
    toast.SetTag(&HSTRING::from(notification.notification_id().to_string()))?;
    toast.SetGroup(&HSTRING::from(TOAST_GROUP))?;
    notifier.Show(&toast)
}

/// Shows limit notifications as Windows toasts.
pub struct ToastDispatcher {
    app_id: String,
}

impl ToastDispatcher {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for ToastDispatcher {
    async fn send(&self, notification: &LimitNotification) -> MonitorResult<()> {
        let app_id = self.app_id.clone();
        let notification = notification.clone();
        tokio::task::spawn_blocking(move || show_toast(&app_id, &notification))
            .await
            .map_err(|err| MonitorError::Dispatch(err.to_string()))?
            .map_err(|err| MonitorError::Dispatch(err.message().to_string()))
    }
}
