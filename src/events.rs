use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::BackendKind;
use crate::session::SessionPhase;

/// Everything observable about the session, published for logging and UI
/// subscribers. The core never waits on a subscriber.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionRequested,
    ConnectionEstablished { backend: BackendKind },
    ConnectionLost { reason: String },
    ConnectionFailed { error: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Disconnected,

    ListeningStarted,
    ListeningStopped,
    ListeningError { error: String },
    TranscriptUpdate { text: String, is_final: bool },
    UserUtterance { text: String },
    UserInterrupted,

    AssistantSpeakingStarted,
    AssistantSpeakingStopped,
    AssistantResponse {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },

    TtsStarted { provider: &'static str },
    TtsEnded { provider: &'static str },
    TtsError { provider: &'static str, error: String },

    StateChanged {
        from: SessionPhase,
        to: SessionPhase,
        reason: String,
        forced: bool,
    },

    /// Non-fatal error surfaced for observers.
    Error { source: &'static str, error: String },
    /// A retry ceiling was exhausted; a full client restart follows.
    Fatal { source: &'static str, error: String },
}

/// Broadcast fan-out. Slow subscribers lag and lose events rather than
/// back-pressuring the session core.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
