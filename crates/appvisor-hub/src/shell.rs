use crate::supervisor::SupervisorEvent;
use appvisor_core::{shutdown::CloseReply, Platform, WindowHandle};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io, path::PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Messages pushed into a window's hosted UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    AboutToClose,
    WindowFocused { window_id: String },
    OpenCallbackUrl { url: String },
}

/// Messages a hosted UI sends back to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiMessage {
    SecondaryWindowAnnounce { window_id: String },
    CloseConfirmation(CloseReply),
}

/// Native windowing and process control the supervisor drives. Every call on
/// a handle that no longer exists must be a no-op.
pub trait DesktopShell {
    fn platform(&self) -> Platform;

    fn create_primary_window(&mut self, visible: bool) -> WindowHandle;
    fn window_exists(&self, window: WindowHandle) -> bool;
    /// False while the whole application is hidden.
    fn is_visible(&self, window: WindowHandle) -> bool;
    fn is_minimized(&self, window: WindowHandle) -> bool;
    fn focused_window(&self) -> Option<WindowHandle>;
    fn zoom_factor(&self, window: WindowHandle) -> Option<f64>;

    fn set_zoom_factor(&mut self, window: WindowHandle, factor: f64);
    fn restore(&mut self, window: WindowHandle);
    fn show(&mut self, window: WindowHandle);
    fn hide(&mut self, window: WindowHandle);
    fn focus(&mut self, window: WindowHandle);
    fn destroy(&mut self, window: WindowHandle);

    fn send_to_ui(&mut self, window: WindowHandle, event: UiEvent);

    /// Hides the whole application, menu bar included.
    fn hide_application(&mut self);
    fn quit_application(&mut self, exit_code: i32);
    fn launch_alt_instance(&mut self, alt_instance_id: &str) -> io::Result<()>;

    fn is_focused(&self, window: WindowHandle) -> bool {
        self.focused_window() == Some(window)
    }
}

#[derive(Debug, Clone)]
struct HeadlessWindow {
    visible: bool,
    minimized: bool,
    zoom: f64,
}

/// Shell used when no native toolkit is attached. Windows are bookkeeping
/// only and the hosted UI always agrees to close.
#[derive(Debug)]
pub struct HeadlessShell {
    platform: Platform,
    windows: BTreeMap<WindowHandle, HeadlessWindow>,
    focused: Option<WindowHandle>,
    next_handle: u64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    relaunch_args: Vec<String>,
}

impl HeadlessShell {
    pub fn new(events: mpsc::UnboundedSender<SupervisorEvent>, relaunch_args: Vec<String>) -> Self {
        Self {
            platform: Platform::current(),
            windows: BTreeMap::new(),
            focused: None,
            next_handle: 1,
            events,
            relaunch_args,
        }
    }

    fn window_mut(&mut self, window: WindowHandle) -> Option<&mut HeadlessWindow> {
        self.windows.get_mut(&window)
    }
}

impl DesktopShell for HeadlessShell {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn create_primary_window(&mut self, visible: bool) -> WindowHandle {
        let handle = WindowHandle(self.next_handle);
        self.next_handle += 1;
        self.windows.insert(
            handle,
            HeadlessWindow {
                visible,
                minimized: false,
                zoom: 1.0,
            },
        );
        if visible {
            self.focused = Some(handle);
        }
        info!(event = "window_created", window = %handle, visible);
        handle
    }

    fn window_exists(&self, window: WindowHandle) -> bool {
        self.windows.contains_key(&window)
    }

    fn is_visible(&self, window: WindowHandle) -> bool {
        self.windows.get(&window).is_some_and(|state| state.visible)
    }

    fn is_minimized(&self, window: WindowHandle) -> bool {
        self.windows.get(&window).is_some_and(|state| state.minimized)
    }

    fn focused_window(&self) -> Option<WindowHandle> {
        self.focused.filter(|window| self.windows.contains_key(window))
    }

    fn zoom_factor(&self, window: WindowHandle) -> Option<f64> {
        self.windows.get(&window).map(|state| state.zoom)
    }

    fn set_zoom_factor(&mut self, window: WindowHandle, factor: f64) {
        if let Some(state) = self.window_mut(window) {
            state.zoom = factor;
        }
    }

    fn restore(&mut self, window: WindowHandle) {
        if let Some(state) = self.window_mut(window) {
            state.minimized = false;
        }
    }

    fn show(&mut self, window: WindowHandle) {
        if let Some(state) = self.window_mut(window) {
            state.visible = true;
        }
    }

    fn hide(&mut self, window: WindowHandle) {
        if let Some(state) = self.window_mut(window) {
            state.visible = false;
        }
        if self.focused == Some(window) {
            self.focused = None;
        }
    }

    fn focus(&mut self, window: WindowHandle) {
        if self.windows.contains_key(&window) {
            self.focused = Some(window);
        }
    }

    fn destroy(&mut self, window: WindowHandle) {
        if self.windows.remove(&window).is_some() {
            debug!(event = "window_destroyed", window = %window);
        }
        if self.focused == Some(window) {
            self.focused = None;
        }
    }

    fn send_to_ui(&mut self, window: WindowHandle, event: UiEvent) {
        if !self.windows.contains_key(&window) {
            return;
        }
        debug!(event = "ui_event", window = %window, ui_event = ?event);
        if event == UiEvent::AboutToClose {
            let reply = SupervisorEvent::Ui {
                window,
                message: UiMessage::CloseConfirmation(CloseReply { can_close: true }),
            };
            let _ = self.events.send(reply);
        }
    }

    fn hide_application(&mut self) {
        for state in self.windows.values_mut() {
            state.visible = false;
        }
        self.focused = None;
    }

    fn quit_application(&mut self, exit_code: i32) {
        info!(event = "application_quit", exit_code);
    }

    fn launch_alt_instance(&mut self, alt_instance_id: &str) -> io::Result<()> {
        let exe: PathBuf = std::env::current_exe()?;
        let child = std::process::Command::new(&exe)
            .args(&self.relaunch_args)
            .arg("--alt-instance-id")
            .arg(alt_instance_id)
            .spawn();
        match child {
            Ok(child) => {
                info!(event = "alt_instance_launched", pid = child.id(), alt_instance_id);
                Ok(())
            }
            Err(err) => {
                warn!(event = "alt_instance_launch_error", error = %err);
                Err(err)
            }
        }
    }
}
