use crate::Platform;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseState {
    Open,
    /// A reply from the hosted UI is in hand and the close routine is about
    /// to run again to act on it.
    CloseRequested,
    AwaitingConfirmation,
    ConfirmedClose,
    Vetoed,
}

impl CloseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseState::Open => "open",
            CloseState::CloseRequested => "close_requested",
            CloseState::AwaitingConfirmation => "awaiting_confirmation",
            CloseState::ConfirmedClose => "confirmed_close",
            CloseState::Vetoed => "vetoed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CloseState::ConfirmedClose)
    }
}

impl fmt::Display for CloseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReply {
    #[serde(alias = "canClose")]
    pub can_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseContext {
    pub platform: Platform,
    pub will_quit: bool,
    pub tray_shown: bool,
    pub secondary_windows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEffect {
    /// Cancel the native close so the window survives this attempt.
    SuppressClose,
    HideApplication,
    HidePrimary,
    NotifyAboutToClose,
    ReleasePrimary,
    DiscardReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: CloseState,
    pub to: CloseState,
    pub effects: Vec<CloseEffect>,
    pub consumed_reply: bool,
}

impl Transition {
    fn stay(from: CloseState, effects: Vec<CloseEffect>) -> Self {
        Self {
            from,
            to: from,
            effects,
            consumed_reply: false,
        }
    }

    pub fn has(&self, effect: CloseEffect) -> bool {
        self.effects.contains(&effect)
    }
}

/// One evaluation of a close attempt against the primary window.
pub fn evaluate_close(
    state: CloseState,
    pending: Option<CloseReply>,
    ctx: &CloseContext,
) -> Transition {
    if state.is_terminal() {
        return Transition {
            from: state,
            to: state,
            effects: Vec::new(),
            consumed_reply: pending.is_some(),
        };
    }

    if ctx.platform.keeps_app_resident() {
        if !ctx.will_quit {
            return Transition::stay(
                state,
                vec![CloseEffect::SuppressClose, CloseEffect::HideApplication],
            );
        }
    } else if (ctx.secondary_windows > 0 || ctx.tray_shown) && !ctx.will_quit {
        return Transition::stay(
            state,
            vec![CloseEffect::SuppressClose, CloseEffect::HidePrimary],
        );
    }

    match pending {
        None => Transition {
            from: state,
            to: CloseState::AwaitingConfirmation,
            effects: vec![CloseEffect::SuppressClose, CloseEffect::NotifyAboutToClose],
            consumed_reply: false,
        },
        Some(CloseReply { can_close: true }) => Transition {
            from: state,
            to: CloseState::ConfirmedClose,
            effects: vec![CloseEffect::ReleasePrimary],
            consumed_reply: true,
        },
        Some(CloseReply { can_close: false }) => Transition {
            from: state,
            to: CloseState::Vetoed,
            effects: vec![CloseEffect::SuppressClose, CloseEffect::DiscardReply],
            consumed_reply: true,
        },
    }
}

/// Holds the quit-negotiation state between close evaluations.
#[derive(Debug, Clone)]
pub struct ShutdownNegotiator {
    state: CloseState,
    pending: Option<CloseReply>,
    will_quit: bool,
    tray_shown: bool,
}

impl Default for ShutdownNegotiator {
    fn default() -> Self {
        Self {
            state: CloseState::Open,
            pending: None,
            will_quit: false,
            tray_shown: false,
        }
    }
}

impl ShutdownNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CloseState {
        self.state
    }

    pub fn pending_reply(&self) -> Option<CloseReply> {
        self.pending
    }

    pub fn will_quit(&self) -> bool {
        self.will_quit
    }

    pub fn set_will_quit(&mut self, will_quit: bool) {
        self.will_quit = will_quit;
    }

    pub fn tray_shown(&self) -> bool {
        self.tray_shown
    }

    pub fn set_tray_shown(&mut self, shown: bool) {
        self.tray_shown = shown;
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Stores the hosted UI's answer. Only the latest answer is kept.
    pub fn record_reply(&mut self, reply: CloseReply) {
        self.pending = Some(reply);
        if !self.state.is_terminal() {
            self.state = CloseState::CloseRequested;
        }
    }

    pub fn discard_reply(&mut self) -> Option<CloseReply> {
        self.pending.take()
    }

    pub fn on_close_attempt(&mut self, platform: Platform, secondary_windows: usize) -> Transition {
        if self.state == CloseState::Vetoed {
            self.state = CloseState::Open;
        }
        let ctx = CloseContext {
            platform,
            will_quit: self.will_quit,
            tray_shown: self.tray_shown,
            secondary_windows,
        };
        let transition = evaluate_close(self.state, self.pending, &ctx);
        if transition.consumed_reply {
            self.pending = None;
        }
        if transition.to == CloseState::Vetoed {
            self.will_quit = false;
        }
        self.state = transition.to;
        transition
    }
}
