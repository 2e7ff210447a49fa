use crate::{
    config::SupervisorConfig,
    control_channel::{
        probe_until_gone, request_alt_restart, ControlServer, Endpoint, InboundControl,
        ProbeOutcome,
    },
    lock_keeper::LockKeeper,
    shell::{DesktopShell, UiEvent, UiMessage},
};
use appvisor_core::{
    control_ipc::{ControlAction, ControlReply, ControlRequest, SecondInstancePayload},
    launch::{find_callback_url, DEFAULT_ALT_INSTANCE_ID},
    shutdown::{CloseEffect, CloseReply, ShutdownNegotiator},
    window_registry::WindowRegistry,
    WindowHandle,
};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Everything that can happen to the supervisor, from the native host, the
/// hosted UI, or its own background tasks.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    NativeClose { window: WindowHandle },
    WindowClosed { window: WindowHandle },
    WindowFocused { window: WindowHandle },
    Ui { window: WindowHandle, message: UiMessage },
    TrayVisibility(bool),
    TrayClicked,
    BeforeQuit,
    Activate,
    OpenUrl { url: String },
    AllWindowsClosed,
    RelaunchAltInstance,
    RestartRequested,
    HostFailure { reason: String },
    QuitRequested,
    /// Leaves without asking the hosted UI.
    Exit { code: i32 },
}

pub struct Supervisor<S: DesktopShell> {
    config: SupervisorConfig,
    shell: S,
    registry: WindowRegistry,
    negotiator: ShutdownNegotiator,
    lock: Option<LockKeeper>,
    server: Option<ControlServer>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    exit_code: Option<i32>,
}

impl<S: DesktopShell> Supervisor<S> {
    pub fn new(
        config: SupervisorConfig,
        shell: S,
        server: Option<ControlServer>,
        lock: Option<LockKeeper>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            config,
            shell,
            registry: WindowRegistry::new(),
            negotiator: ShutdownNegotiator::new(),
            lock,
            server,
            events,
            exit_code: None,
        }
    }

    pub fn ipc_server_started(&self) -> bool {
        self.server.is_some()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.server.as_ref().map(ControlServer::endpoint)
    }

    pub fn create_primary_window(&mut self, visible: bool) -> WindowHandle {
        let primary = self.shell.create_primary_window(visible);
        self.registry.set_primary(primary);
        if let Some(url) = self.config.initial_callback_url.clone() {
            self.shell.send_to_ui(primary, UiEvent::OpenCallbackUrl { url });
        }
        primary
    }

    pub async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
        mut control_rx: mpsc::UnboundedReceiver<InboundControl>,
    ) -> i32 {
        while self.exit_code.is_none() {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some(inbound) = control_rx.recv() => self.handle_control(inbound),
            }
        }
        self.finish(0);
        self.exit_code.unwrap_or(0)
    }

    pub fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::NativeClose { window } => {
                if self.registry.primary() == Some(window) {
                    self.close_primary();
                }
            }
            SupervisorEvent::WindowClosed { window } => self.on_window_closed(window),
            SupervisorEvent::WindowFocused { window } => self.send_window_focused(window),
            SupervisorEvent::Ui { window, message } => match message {
                UiMessage::SecondaryWindowAnnounce { window_id } => {
                    self.register_secondary(window, &window_id)
                }
                UiMessage::CloseConfirmation(reply) => self.on_close_confirmation(reply),
            },
            SupervisorEvent::TrayVisibility(shown) => self.negotiator.set_tray_shown(shown),
            SupervisorEvent::TrayClicked => self.raise_primary(),
            SupervisorEvent::Activate => {
                if let Some(primary) = self.live_primary() {
                    self.shell.show(primary);
                }
            }
            SupervisorEvent::BeforeQuit => self.negotiator.set_will_quit(true),
            SupervisorEvent::OpenUrl { url } => self.open_callback_url(url),
            SupervisorEvent::AllWindowsClosed => self.finish(0),
            SupervisorEvent::RelaunchAltInstance => self.launch_alt_instance(),
            SupervisorEvent::RestartRequested => self.request_restart(),
            SupervisorEvent::Exit { code } => self.finish(code),
            SupervisorEvent::HostFailure { reason } => {
                error!(event = "host_failure", reason = %reason);
                self.finish(1);
            }
            SupervisorEvent::QuitRequested => {
                self.negotiator.set_will_quit(true);
                if self.live_primary().is_some() {
                    self.close_primary();
                } else {
                    self.finish(0);
                }
            }
        }
    }

    pub fn handle_control(&mut self, inbound: InboundControl) {
        let reply = match inbound.action {
            ControlAction::Ping => ControlReply::ok(true),
            ControlAction::OnSecondInstance => self.on_second_instance(&inbound.request),
            ControlAction::RestartAltInstance => self.on_restart_alt_instance(&inbound.request),
        };
        if inbound.reply.send(reply).is_err() {
            debug!(event = "control_reply_dropped", action = %inbound.action);
        }
    }

    fn on_second_instance(&mut self, request: &ControlRequest) -> ControlReply {
        let payload: SecondInstancePayload = match request.payload() {
            Ok(payload) => payload,
            Err(rejection) => {
                warn!(event = "second_instance_bad_payload", error = %rejection);
                return ControlReply::rejected(&rejection);
            }
        };
        info!(
            event = "second_instance",
            sender_port = ?payload.sender_port,
            profile = %payload.profile_path
        );
        if Path::new(&payload.profile_path) != self.config.profile_dir.as_path() {
            debug!(event = "second_instance_other_profile", profile = %payload.profile_path);
            return ControlReply::ok(false);
        }

        self.raise_primary();
        if !self.shell.platform().keeps_app_resident() {
            if let Some(url) = find_callback_url(&payload.argv) {
                self.open_callback_url(url.to_string());
            }
        }
        ControlReply::ok(true)
    }

    fn on_restart_alt_instance(&mut self, request: &ControlRequest) -> ControlReply {
        if self.config.is_alt_instance() {
            debug!(event = "alt_restart_refused", reason = "receiver_is_alt_instance");
            return ControlReply::ok(false);
        }
        let Some(source_port) = request.source_port else {
            warn!(event = "alt_restart_missing_source_port");
            return ControlReply::ok(false);
        };
        let Some(endpoint) = self.endpoint().cloned() else {
            warn!(event = "alt_restart_without_endpoint");
            return ControlReply::ok(false);
        };

        let timings = self.config.control;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timings.relaunch_delay).await;
            match probe_until_gone(&endpoint, source_port, &timings).await {
                ProbeOutcome::Gone { probes } => {
                    info!(event = "alt_instance_exited", port = source_port, probes);
                    tokio::time::sleep(timings.relaunch_grace).await;
                    let _ = events.send(SupervisorEvent::RelaunchAltInstance);
                }
                ProbeOutcome::StillAlive { probes } => {
                    warn!(event = "alt_instance_still_running", port = source_port, probes);
                }
            }
        });
        ControlReply::ok(true)
    }

    /// An alternate instance cannot relaunch itself; it asks the owner to do
    /// it once this process is gone, then exits either way.
    fn request_restart(&mut self) {
        if !self.config.is_alt_instance() {
            warn!(event = "restart_unsupported", reason = "not_alt_instance");
            return;
        }
        let endpoint = self.endpoint().cloned();
        let port = self.config.ipc_port;
        let timings = self.config.control;
        let events = self.events.clone();
        tokio::spawn(async move {
            let accepted = request_alt_restart(endpoint.as_ref(), port, &timings).await;
            if accepted {
                info!(event = "alt_restart_accepted");
            } else {
                warn!(event = "alt_restart_unanswered", hint = "relaunch manually");
            }
            let _ = events.send(SupervisorEvent::Exit { code: 0 });
        });
    }

    fn launch_alt_instance(&mut self) {
        if !self.ipc_server_started() {
            warn!(event = "alt_launch_refused", reason = "ipc_server_not_started");
            return;
        }
        if let Err(err) = self.shell.launch_alt_instance(DEFAULT_ALT_INSTANCE_ID) {
            error!(event = "alt_launch_failed", error = %err);
        }
    }

    fn live_primary(&self) -> Option<WindowHandle> {
        self.registry
            .primary()
            .filter(|primary| self.shell.window_exists(*primary))
    }

    fn raise_primary(&mut self) {
        let Some(primary) = self.live_primary() else {
            return;
        };
        if self.shell.is_minimized(primary) {
            self.shell.restore(primary);
        }
        self.shell.show(primary);
        self.shell.focus(primary);
    }

    fn open_callback_url(&mut self, url: String) {
        if let Some(primary) = self.live_primary() {
            info!(event = "callback_url", url = %url);
            self.shell.send_to_ui(primary, UiEvent::OpenCallbackUrl { url });
        }
    }

    fn send_window_focused(&mut self, window: WindowHandle) {
        let Some(window_id) = self.registry.reverse_resolve(window) else {
            return;
        };
        if let Some(primary) = self.live_primary() {
            self.shell.send_to_ui(primary, UiEvent::WindowFocused { window_id });
        }
    }

    fn register_secondary(&mut self, window: WindowHandle, window_id: &str) {
        if !self.shell.window_exists(window) {
            debug!(event = "secondary_window_gone", window = %window, window_id);
            return;
        }
        match self.registry.register(window_id, window) {
            Ok(previous) => info!(
                event = "secondary_window_registered",
                window = %window,
                window_id,
                replaced = previous.is_some()
            ),
            Err(err) => {
                warn!(event = "secondary_window_rejected", window = %window, error = %err);
                return;
            }
        }

        if let Some(zoom) = self.live_primary().and_then(|p| self.shell.zoom_factor(p)) {
            self.shell.set_zoom_factor(window, zoom);
        }
        if self.shell.is_focused(window) {
            self.send_window_focused(window);
        }
    }

    fn on_window_closed(&mut self, window: WindowHandle) {
        if self.registry.primary() == Some(window) {
            self.registry.clear_primary();
            debug!(event = "primary_window_closed", window = %window);
            return;
        }
        let Some(window_id) = self.registry.unregister_handle(window) else {
            return;
        };
        info!(event = "secondary_window_closed", window = %window, window_id = %window_id);

        let primary_visible = self
            .live_primary()
            .is_some_and(|primary| self.shell.is_visible(primary));
        if self.registry.secondary_count() == 0
            && !primary_visible
            && !self.negotiator.tray_shown()
        {
            info!(event = "cascade_close");
            self.close_primary();
        }
    }

    fn on_close_confirmation(&mut self, reply: CloseReply) {
        info!(event = "close_confirmation", can_close = reply.can_close);
        self.negotiator.record_reply(reply);
        self.negotiator.set_will_quit(true);
        self.close_primary();
    }

    fn close_primary(&mut self) {
        let Some(primary) = self.live_primary() else {
            if self.negotiator.discard_reply().is_some() {
                debug!(event = "close_reply_without_window");
            }
            return;
        };

        let transition = self
            .negotiator
            .on_close_attempt(self.shell.platform(), self.registry.secondary_count());
        debug!(event = "close_evaluated", from = %transition.from, to = %transition.to);

        for effect in transition.effects {
            match effect {
                CloseEffect::SuppressClose => {}
                CloseEffect::HideApplication => {
                    self.shell.hide_application();
                }
                CloseEffect::HidePrimary => {
                    self.shell.hide(primary);
                }
                CloseEffect::NotifyAboutToClose => {
                    self.shell.send_to_ui(primary, UiEvent::AboutToClose);
                }
                CloseEffect::DiscardReply => {
                    info!(event = "close_vetoed");
                }
                CloseEffect::ReleasePrimary => {
                    self.release_windows();
                    self.finish(0);
                }
            }
        }
    }

    fn release_windows(&mut self) {
        for window in self.registry.secondary_handles() {
            self.registry.unregister_handle(window);
            self.shell.destroy(window);
        }
        if let Some(primary) = self.registry.clear_primary() {
            self.shell.destroy(primary);
        }
    }

    fn finish(&mut self, exit_code: i32) {
        if self.exit_code.is_some() {
            return;
        }
        self.exit_code = Some(exit_code);
        if let Some(lock) = self.lock.as_mut().filter(|lock| lock.is_held()) {
            lock.release();
        }
        if let Some(server) = self.server.as_mut() {
            server.stop();
        }
        self.shell.quit_application(exit_code);
    }
}

#[cfg(test)]
impl<S: DesktopShell> Supervisor<S> {
    fn registry(&self) -> &WindowRegistry {
        &self.registry
    }

    fn negotiator(&self) -> &ShutdownNegotiator {
        &self.negotiator
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}
