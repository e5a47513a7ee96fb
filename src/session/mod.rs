//! Finite-state session model plus the persistent intent/fact flags.
//!
//! The phase encodes *where the session is*; the flags encode *what the
//! user wants and what is actually true* and survive phase changes. Every
//! other component consults this before acting, and only the component
//! responsible for a fact writes its flag.

use std::fmt;
use std::sync::Mutex;

use crate::events::{EventBus, SessionEvent};
use crate::ui::UiSink;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Reconnecting,
    Error,
}

impl SessionPhase {
    /// The transition table is intentionally permissive: for an unattended
    /// kiosk it is better to allow a transition and recover than to block
    /// and wedge.
    pub fn allowed_successors(self) -> &'static [SessionPhase] {
        use SessionPhase::*;
        match self {
            Idle => &[Connecting],
            Connecting => &[Connected, Error, Reconnecting, Idle],
            Connected => &[Listening, Idle, Reconnecting, Error, Connecting],
            Listening => &[Processing, Speaking, Connected, Idle, Reconnecting, Error],
            Processing => &[Speaking, Listening, Connected, Idle, Reconnecting, Error],
            Speaking => &[Listening, Connected, Idle, Reconnecting, Error],
            Reconnecting => &[Connecting, Connected, Idle, Error],
            Error => &[Idle, Connecting, Reconnecting],
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Connected => "connected",
            SessionPhase::Listening => "listening",
            SessionPhase::Processing => "processing",
            SessionPhase::Speaking => "speaking",
            SessionPhase::Reconnecting => "reconnecting",
            SessionPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// The four persistent flags. Each has exactly one writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFlag {
    /// User wants the connection maintained (drives auto-reconnect).
    WantsConnected,
    /// User wants speech capture active.
    WantsListening,
    /// The assistant is audibly speaking right now.
    AssistantSpeaking,
    /// The capture engine is actually running.
    CaptureActive,
}

impl fmt::Display for SessionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionFlag::WantsConnected => "wants-connected",
            SessionFlag::WantsListening => "wants-listening",
            SessionFlag::AssistantSpeaking => "assistant-speaking",
            SessionFlag::CaptureActive => "capture-active",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    wants_connected: bool,
    wants_listening: bool,
    assistant_speaking: bool,
    capture_active: bool,
}

impl Flags {
    fn get(&self, flag: SessionFlag) -> bool {
        match flag {
            SessionFlag::WantsConnected => self.wants_connected,
            SessionFlag::WantsListening => self.wants_listening,
            SessionFlag::AssistantSpeaking => self.assistant_speaking,
            SessionFlag::CaptureActive => self.capture_active,
        }
    }

    fn set(&mut self, flag: SessionFlag, value: bool) {
        match flag {
            SessionFlag::WantsConnected => self.wants_connected = value,
            SessionFlag::WantsListening => self.wants_listening = value,
            SessionFlag::AssistantSpeaking => self.assistant_speaking = value,
            SessionFlag::CaptureActive => self.capture_active = value,
        }
    }
}

/// Debug view of the whole machine.
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub previous: Option<SessionPhase>,
    pub wants_connected: bool,
    pub wants_listening: bool,
    pub assistant_speaking: bool,
    pub capture_active: bool,
}

struct Inner {
    phase: SessionPhase,
    previous: Option<SessionPhase>,
    flags: Flags,
}

/// Shared session state. Lock sections are short and never held across an
/// await; events are published after the lock is released.
pub struct SharedSession {
    inner: Mutex<Inner>,
    bus: EventBus,
    ui: Arc<dyn UiSink>,
}

impl SharedSession {
    pub fn new(bus: EventBus, ui: Arc<dyn UiSink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: SessionPhase::Idle,
                previous: None,
                flags: Flags::default(),
            }),
            bus,
            ui,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().expect("session lock").phase
    }

    pub fn previous_phase(&self) -> Option<SessionPhase> {
        self.inner.lock().expect("session lock").previous
    }

    pub fn is(&self, phase: SessionPhase) -> bool {
        self.phase() == phase
    }

    pub fn is_one_of(&self, phases: &[SessionPhase]) -> bool {
        phases.contains(&self.phase())
    }

    /// Attempt a checked transition. Already being in `target` is a no-op
    /// success. On success the previous phase is recorded and a state-changed
    /// event published; on rejection nothing is published.
    pub fn transition(&self, target: SessionPhase, reason: &str) -> bool {
        let from = {
            let mut inner = self.inner.lock().expect("session lock");
            if inner.phase == target {
                return true;
            }
            if !inner.phase.allowed_successors().contains(&target) {
                let from = inner.phase;
                drop(inner);
                self.ui
                    .log(&format!("[state] blocked: {from} -> {target}"));
                tracing::warn!(target: "vigil::session", %from, to = %target, "invalid transition");
                return false;
            }
            let from = inner.phase;
            inner.previous = Some(from);
            inner.phase = target;
            from
        };

        self.ui
            .log(&format!("[state] {from} -> {target} ({reason})"));
        self.bus.publish(SessionEvent::StateChanged {
            from,
            to: target,
            reason: reason.to_string(),
            forced: false,
        });
        true
    }

    /// Bypass the transition table. Recovery paths only; never steady-state
    /// logic. The published event is tagged as forced.
    pub fn force(&self, target: SessionPhase, reason: &str) {
        let from = {
            let mut inner = self.inner.lock().expect("session lock");
            let from = inner.phase;
            inner.previous = Some(from);
            inner.phase = target;
            from
        };

        self.ui
            .log(&format!("[state] FORCED: {from} -> {target} ({reason})"));
        self.bus.publish(SessionEvent::StateChanged {
            from,
            to: target,
            reason: reason.to_string(),
            forced: true,
        });
    }

    pub fn flag(&self, flag: SessionFlag) -> bool {
        self.inner.lock().expect("session lock").flags.get(flag)
    }

    /// Set a flag, logging only when the value actually changes.
    pub fn set_flag(&self, flag: SessionFlag, value: bool) {
        let changed = {
            let mut inner = self.inner.lock().expect("session lock");
            let old = inner.flags.get(flag);
            inner.flags.set(flag, value);
            old != value
        };
        if changed {
            self.ui
                .log(&format!("[state] flag {flag}: {} -> {}", !value, value));
        }
    }

    /// Connected in the loose sense: any phase that presumes a live session.
    pub fn is_connectedish(&self) -> bool {
        use SessionPhase::*;
        self.is_one_of(&[Connected, Listening, Processing, Speaking])
    }

    pub fn can_listen(&self) -> bool {
        use SessionPhase::*;
        self.is_one_of(&[Connected, Listening]) && !self.flag(SessionFlag::AssistantSpeaking)
    }

    pub fn can_send_message(&self) -> bool {
        self.is_connectedish() && !self.flag(SessionFlag::AssistantSpeaking)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().expect("session lock");
        SessionSnapshot {
            phase: inner.phase,
            previous: inner.previous,
            wants_connected: inner.flags.wants_connected,
            wants_listening: inner.flags.wants_listening,
            assistant_speaking: inner.flags.assistant_speaking,
            capture_active: inner.flags.capture_active,
        }
    }
}
