//! Mutex-guarded retry wrapper around the speech-to-text engine, plus
//! endpointing and barge-in detection.
//!
//! The start guard is a reentrancy guard, not a thread lock: callbacks and
//! retries interleave on the runtime and must not double-start the engine.
//! Every exit path (success, error, timeout) releases it; a health
//! watchdog clears it if it ever sticks anyway.

pub mod endpoint;
pub mod engine;
pub mod phrases;

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::config::{self, backoff_delay, SpeakingPolicy};
use crate::context::SessionContext;
use crate::error::RestartReason;
use crate::events::SessionEvent;
use crate::session::{SessionFlag, SessionPhase};
use crate::ui::TranscriptState;
use crate::watchdog::names;

use engine::{EngineErrorKind, EngineEvent, EngineEventReceiver, SpeechEngine};

/// The single authoritative entry point for the assistant-speaking fact.
/// Every playback path must go through this; nothing else writes the flag.
pub trait SpeakingSink: Send + Sync {
    fn set_assistant_speaking(&self, speaking: bool);
}

/// Something that can halt in-progress playback (queue and audio both).
pub trait PlaybackHalt: Send + Sync {
    fn halt(&self);
}

struct CaptureState {
    /// Reentrancy guard against concurrent start attempts.
    start_guard: bool,
    retry_count: u32,
    /// At most one backoff retry may be scheduled at a time.
    retry_pending: bool,
    /// Bumped on stop; sleeping retries from an older epoch no-op.
    epoch: u64,
    /// Accumulated final fragments of the pending utterance.
    transcript: String,
    /// Latest interim hypothesis, replaced on every partial.
    partial: String,
    /// Each armed silence timer carries the sequence current at arm time; a
    /// superseded timer that still fires sees the mismatch and no-ops.
    silence_seq: u64,
}

pub struct CaptureLoop {
    ctx: SessionContext,
    weak: Weak<CaptureLoop>,
    engine: Mutex<Option<Arc<dyn SpeechEngine>>>,
    playback: Mutex<Option<Arc<dyn PlaybackHalt>>>,
    utterance_tx: mpsc::Sender<String>,
    restart_tx: mpsc::Sender<RestartReason>,
    state: Mutex<CaptureState>,
}

impl CaptureLoop {
    pub fn new(
        ctx: SessionContext,
        utterance_tx: mpsc::Sender<String>,
        restart_tx: mpsc::Sender<RestartReason>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ctx,
            weak: weak.clone(),
            engine: Mutex::new(None),
            playback: Mutex::new(None),
            utterance_tx,
            restart_tx,
            state: Mutex::new(CaptureState {
                start_guard: false,
                retry_count: 0,
                retry_pending: false,
                epoch: 0,
                transcript: String::new(),
                partial: String::new(),
                silence_seq: 0,
            }),
        })
    }

    fn me(&self) -> Arc<Self> {
        self.weak.upgrade().expect("capture loop alive")
    }

    /// Attach the engine and start pumping its events. The receiver is the
    /// engine's callback stream.
    pub fn attach_engine(&self, engine: Arc<dyn SpeechEngine>, mut events: EngineEventReceiver) {
        *self.engine.lock().expect("capture lock") = Some(engine);
        let me = self.me();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                me.handle_engine_event(event).await;
            }
        });
    }

    /// Late-bound handle to the playback side, used for barge-in halts.
    pub fn set_playback(&self, playback: Arc<dyn PlaybackHalt>) {
        *self.playback.lock().expect("capture lock") = Some(playback);
    }

    /// Attempt to start the engine. Preconditions are checked together with
    /// guard acquisition; a benign already-running race counts as success.
    pub async fn try_start(&self) {
        let engine = self.engine.lock().expect("capture lock").clone();
        let Some(engine) = engine else {
            self.ctx.ui.log("[capture] try_start: no engine attached");
            return;
        };

        {
            let mut st = self.state.lock().expect("capture lock");
            if st.start_guard {
                self.ctx.ui.log("[capture] try_start: blocked (start in progress)");
                return;
            }
            if self.ctx.session.flag(SessionFlag::CaptureActive) {
                self.ctx.ui.log("[capture] try_start: already active");
                return;
            }
            if !self.ctx.session.flag(SessionFlag::WantsListening) {
                return;
            }
            if config::speaking_policy(self.ctx.settings.as_ref()) == SpeakingPolicy::MutedWhileSpeaking
                && self.ctx.session.flag(SessionFlag::AssistantSpeaking)
            {
                self.ctx.ui.log("[capture] try_start: assistant speaking");
                return;
            }
            st.start_guard = true;
        }

        // A hung engine call must complete as if it had failed.
        let started = match tokio::time::timeout(
            self.ctx.tuning.engine_call_timeout,
            engine.start(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::error::CaptureError::StartFailed(
                "engine start timed out".to_string(),
            )),
        };

        match started {
            Ok(()) => {
                // Guard is released by the Started event.
                self.state.lock().expect("capture lock").retry_count = 0;
            }
            Err(crate::error::CaptureError::AlreadyRunning) => {
                self.state.lock().expect("capture lock").start_guard = false;
                self.ctx
                    .ui
                    .log("[capture] engine already running (race handled)");
            }
            Err(e) => {
                let (count, exhausted) = {
                    let mut st = self.state.lock().expect("capture lock");
                    st.start_guard = false;
                    st.retry_count += 1;
                    (
                        st.retry_count,
                        st.retry_count >= self.ctx.tuning.max_capture_retry_attempts,
                    )
                };
                self.ctx.ui.log(&format!("[capture] start error: {e}"));
                if exhausted {
                    self.fatal_restart(format!("max retry attempts ({count}) exceeded"));
                    return;
                }
                self.ctx.ui.log(&format!(
                    "[capture] scheduling retry (attempt {count}/{})",
                    self.ctx.tuning.max_capture_retry_attempts
                ));
                self.schedule_retry();
            }
        }
    }

    /// Schedule one backed-off retry. A second failure while one is pending
    /// does not stack another.
    fn schedule_retry(&self) {
        let (delay, epoch) = {
            let mut st = self.state.lock().expect("capture lock");
            if st.retry_pending {
                return;
            }
            st.retry_pending = true;
            (
                backoff_delay(
                    self.ctx.tuning.base_capture_retry_delay,
                    self.ctx.tuning.max_capture_retry_delay,
                    st.retry_count,
                ),
                st.epoch,
            )
        };
        let me = self.me();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut st = me.state.lock().expect("capture lock");
                if st.epoch != epoch {
                    return;
                }
                st.retry_pending = false;
            }
            if me.ctx.session.flag(SessionFlag::WantsListening)
                && !me.ctx.session.flag(SessionFlag::CaptureActive)
            {
                me.try_start().await;
            }
        });
    }

    fn fatal_restart(&self, error: String) {
        self.ctx
            .ui
            .log(&format!("[capture] CRITICAL: {error}"));
        self.ctx.ui.toast("restarting client...");
        // Stand down: the watchdogs would keep retriggering starts while
        // the restart is pending.
        self.ctx.watchdogs.stop(names::CAPTURE_RESTART);
        self.ctx.watchdogs.stop(names::CAPTURE_HEALTH);
        self.ctx.bus.publish(SessionEvent::Fatal {
            source: "capture",
            error,
        });
        let tx = self.restart_tx.clone();
        let delay = self.ctx.tuning.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RestartReason::CaptureExhausted).await;
        });
    }

    pub(crate) async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Started => self.on_started(),
            EngineEvent::Ended => self.on_ended(),
            EngineEvent::Error { kind, message } => self.on_error(kind, message),
            EngineEvent::Result {
                text,
                is_final,
                confidence,
            } => self.on_result(text, is_final, confidence),
        }
    }

    fn on_started(&self) {
        self.ctx.session.set_flag(SessionFlag::CaptureActive, true);
        self.state.lock().expect("capture lock").start_guard = false;
        self.ctx
            .ui
            .set_transcript("Listening...", TranscriptState::Listening);
        self.ctx.ui.log("[capture] engine started");
        self.ctx.bus.publish(SessionEvent::ListeningStarted);
        if self.ctx.session.is_connectedish() {
            self.ctx
                .session
                .transition(SessionPhase::Listening, "capture started");
        }
    }

    fn on_ended(&self) {
        self.ctx.session.set_flag(SessionFlag::CaptureActive, false);
        {
            let mut st = self.state.lock().expect("capture lock");
            st.start_guard = false;
            st.silence_seq += 1;
        }
        self.ctx.ui.log("[capture] engine ended");
        self.ctx.bus.publish(SessionEvent::ListeningStopped);

        if self.ctx.session.flag(SessionFlag::WantsListening) {
            if self.state.lock().expect("capture lock").retry_pending {
                self.ctx
                    .ui
                    .log("[capture] auto-restart skipped - retry already pending");
                return;
            }
            self.ctx.ui.log("[capture] auto-restarting");
            self.schedule_retry();
        } else {
            self.ctx
                .ui
                .set_transcript("Press listen to start...", TranscriptState::Idle);
            if self.ctx.session.is_connectedish() {
                self.ctx
                    .session
                    .transition(SessionPhase::Connected, "stopped listening");
            }
        }
    }

    fn on_error(&self, kind: EngineErrorKind, message: String) {
        self.state.lock().expect("capture lock").start_guard = false;
        self.ctx.session.set_flag(SessionFlag::CaptureActive, false);

        if kind == EngineErrorKind::Aborted {
            return;
        }
        if kind != EngineErrorKind::NoSpeech {
            self.ctx.ui.log(&format!("[capture] error: {message}"));
        }
        self.ctx
            .bus
            .publish(SessionEvent::ListeningError { error: message });

        if kind.is_recoverable() && self.ctx.session.flag(SessionFlag::WantsListening) {
            let pending = {
                let mut st = self.state.lock().expect("capture lock");
                if st.retry_pending {
                    true
                } else {
                    st.retry_count += 1;
                    false
                }
            };
            if pending {
                self.ctx
                    .ui
                    .log("[capture] error retry skipped - retry already pending");
                return;
            }
            self.ctx.ui.log("[capture] recoverable error, retrying");
            self.schedule_retry();
        }
    }

    fn on_result(&self, text: String, is_final: bool, confidence: f32) {
        // While the assistant speaks, recognized text is only ever an
        // interruption command, never the next turn.
        if self.ctx.session.flag(SessionFlag::AssistantSpeaking) {
            let heard = text.trim().to_string();
            if !heard.is_empty() && phrases::is_interruption(&heard) {
                self.ctx
                    .ui
                    .log(&format!("[capture] interruption detected: '{heard}'"));
                let playback = self.playback.lock().expect("capture lock").clone();
                if let Some(playback) = playback {
                    playback.halt();
                }
                // The halt usually clears the flag already; cover the
                // non-streaming paths without publishing stopped twice.
                if self.ctx.session.flag(SessionFlag::AssistantSpeaking) {
                    self.set_assistant_speaking(false);
                }
                {
                    let mut st = self.state.lock().expect("capture lock");
                    st.transcript.clear();
                    st.partial.clear();
                    st.silence_seq += 1;
                }
                self.ctx
                    .ui
                    .set_transcript("Listening...", TranscriptState::Listening);
                self.ctx.bus.publish(SessionEvent::UserInterrupted);
            }
            return;
        }

        let (display, seq) = {
            let mut st = self.state.lock().expect("capture lock");
            if is_final {
                let fragment = text.trim();
                if !fragment.is_empty() {
                    st.transcript.push_str(fragment);
                    st.transcript.push(' ');
                }
                st.partial.clear();
            } else {
                st.partial = text;
            }
            // Any new fragment supersedes the armed silence timer.
            st.silence_seq += 1;
            (format!("{}{}", st.transcript, st.partial), st.silence_seq)
        };

        self.ctx
            .ui
            .set_transcript(&display, TranscriptState::Listening);
        self.ctx.bus.publish(SessionEvent::TranscriptUpdate {
            text: display,
            is_final,
        });

        let ambient = self.ctx.noise.ambient_level();
        let adaptive = endpoint::adaptive_settings(&self.ctx.tuning, ambient);
        let pending = {
            let st = self.state.lock().expect("capture lock");
            st.transcript.trim().to_string()
        };
        if pending.is_empty() || endpoint::word_count(&pending) < adaptive.min_words {
            return;
        }

        let me = self.me();
        tokio::spawn(async move {
            tokio::time::sleep(adaptive.silence_window).await;
            me.fire_silence_timer(seq, confidence).await;
        });
    }

    async fn fire_silence_timer(&self, seq: u64, confidence: f32) {
        // The room may have gotten louder since the timer was armed.
        let ambient = self.ctx.noise.ambient_level();
        let text = {
            let st = self.state.lock().expect("capture lock");
            if st.silence_seq != seq {
                // Superseded by a newer fragment; stale timer no-ops.
                return;
            }
            st.transcript.trim().to_string()
        };
        if text.is_empty() {
            return;
        }

        if endpoint::is_likely_noise(&text, confidence, ambient) {
            self.ctx
                .ui
                .log(&format!("[capture] filtering likely noise: '{text}'"));
            self.clear_utterance();
            self.ctx
                .ui
                .set_transcript("Listening...", TranscriptState::Listening);
            return;
        }

        self.ctx
            .ui
            .log(&format!("[capture] silence detected, sending: {text}"));
        if self.ctx.session.can_send_message() {
            self.clear_utterance();
            self.ctx
                .bus
                .publish(SessionEvent::UserUtterance { text: text.clone() });
            let _ = self.utterance_tx.send(text).await;
            self.ctx
                .ui
                .set_transcript("Processing...", TranscriptState::Waiting);
            self.ctx
                .session
                .transition(SessionPhase::Processing, "user speech sent");
        }
    }

    fn clear_utterance(&self) {
        let mut st = self.state.lock().expect("capture lock");
        st.transcript.clear();
        st.partial.clear();
    }

    async fn stop_engine(&self, engine: Arc<dyn SpeechEngine>) {
        if tokio::time::timeout(self.ctx.tuning.engine_call_timeout, engine.stop())
            .await
            .is_err()
        {
            self.ctx.ui.log("[capture] engine stop timed out");
        }
    }

    /// Flip between wanting and not wanting to listen.
    pub async fn toggle(&self) {
        if self.ctx.session.flag(SessionFlag::WantsListening) {
            self.ctx
                .session
                .set_flag(SessionFlag::WantsListening, false);
            // Block starts while the engine winds down; the Ended event
            // releases the guard.
            self.state.lock().expect("capture lock").start_guard = true;
            self.ctx.watchdogs.stop(names::CAPTURE_RESTART);
            self.ctx.watchdogs.stop(names::CAPTURE_HEALTH);

            let engine = self.engine.lock().expect("capture lock").clone();
            if self.ctx.session.flag(SessionFlag::CaptureActive) {
                if let Some(engine) = engine {
                    self.stop_engine(engine).await;
                }
            }
            {
                let mut st = self.state.lock().expect("capture lock");
                st.silence_seq += 1;
                st.epoch += 1;
                st.retry_pending = false;
                st.retry_count = 0;
                st.transcript.clear();
                st.partial.clear();
            }
        } else {
            self.ctx.session.set_flag(SessionFlag::WantsListening, true);
            {
                let mut st = self.state.lock().expect("capture lock");
                st.start_guard = false;
                st.retry_count = 0;
                st.transcript.clear();
                st.partial.clear();
            }

            let restart = self.me();
            self.ctx.watchdogs.start_capture_watchdog(
                Arc::clone(&self.ctx.session),
                move || {
                    let me = Arc::clone(&restart);
                    tokio::spawn(async move {
                        me.try_start().await;
                    });
                },
            );
            let health = self.me();
            self.ctx.watchdogs.start_capture_health(
                Arc::clone(&self.ctx.session),
                move || {
                    let stuck = {
                        let mut st = health.state.lock().expect("capture lock");
                        if st.start_guard
                            && !health.ctx.session.flag(SessionFlag::CaptureActive)
                        {
                            st.start_guard = false;
                            true
                        } else {
                            false
                        }
                    };
                    if stuck {
                        health
                            .ctx
                            .ui
                            .log("[capture] health check: clearing stuck start guard");
                        let me = Arc::clone(&health);
                        tokio::spawn(async move {
                            me.try_start().await;
                        });
                    }
                },
            );

            if !self.ctx.session.flag(SessionFlag::CaptureActive) {
                self.try_start().await;
            }
        }
    }

    /// Full stop: used by hangup. Clears both capture flags directly; this
    /// is teardown, not a playback state change.
    pub async fn stop(&self) {
        self.ctx
            .session
            .set_flag(SessionFlag::WantsListening, false);
        self.ctx
            .session
            .set_flag(SessionFlag::AssistantSpeaking, false);
        self.ctx.watchdogs.stop(names::CAPTURE_RESTART);
        self.ctx.watchdogs.stop(names::CAPTURE_HEALTH);

        let engine = self.engine.lock().expect("capture lock").clone();
        if self.ctx.session.flag(SessionFlag::CaptureActive) {
            self.state.lock().expect("capture lock").start_guard = true;
            if let Some(engine) = engine {
                self.stop_engine(engine).await;
            }
        }
        {
            let mut st = self.state.lock().expect("capture lock");
            st.silence_seq += 1;
            st.epoch += 1;
            st.retry_pending = false;
            st.retry_count = 0;
            st.start_guard = false;
            st.transcript.clear();
            st.partial.clear();
        }
        self.ctx.session.set_flag(SessionFlag::CaptureActive, false);
        self.ctx
            .ui
            .set_transcript("Press listen to start...", TranscriptState::Idle);
    }
}

impl SpeakingSink for CaptureLoop {
    fn set_assistant_speaking(&self, speaking: bool) {
        self.ctx
            .session
            .set_flag(SessionFlag::AssistantSpeaking, speaking);

        if speaking {
            self.ctx.ui.log("[capture] assistant started speaking");
            self.ctx.bus.publish(SessionEvent::AssistantSpeakingStarted);
            if self.ctx.session.is_connectedish() {
                self.ctx
                    .session
                    .transition(SessionPhase::Speaking, "assistant speaking");
            }

            if config::speaking_policy(self.ctx.settings.as_ref())
                == SpeakingPolicy::MutedWhileSpeaking
                && self.ctx.session.flag(SessionFlag::CaptureActive)
            {
                let engine = self.engine.lock().expect("capture lock").clone();
                if let Some(engine) = engine {
                    self.ctx.ui.log("[capture] engine paused while assistant speaks");
                    let me = self.me();
                    tokio::spawn(async move {
                        me.stop_engine(engine).await;
                    });
                }
            }

            {
                let mut st = self.state.lock().expect("capture lock");
                st.silence_seq += 1;
                st.transcript.clear();
                st.partial.clear();
            }
            self.ctx
                .ui
                .set_transcript("Assistant is speaking...", TranscriptState::Waiting);
        } else {
            self.ctx.ui.log("[capture] assistant stopped speaking");
            self.ctx.bus.publish(SessionEvent::AssistantSpeakingStopped);

            {
                let mut st = self.state.lock().expect("capture lock");
                st.transcript.clear();
                st.partial.clear();
                st.retry_count = 0;
            }

            if self.ctx.session.flag(SessionFlag::WantsListening) {
                self.ctx
                    .ui
                    .set_transcript("Listening...", TranscriptState::Listening);
                if self.ctx.session.is_connectedish() {
                    self.ctx
                        .session
                        .transition(SessionPhase::Listening, "assistant finished");
                }
                if !self.ctx.session.flag(SessionFlag::CaptureActive) {
                    self.ctx
                        .ui
                        .log("[capture] restarting engine after assistant finished");
                    let me = self.me();
                    let delay = self.ctx.tuning.capture_resume_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if me.ctx.session.flag(SessionFlag::WantsListening)
                            && !me.ctx.session.flag(SessionFlag::AssistantSpeaking)
                            && !me.ctx.session.flag(SessionFlag::CaptureActive)
                        {
                            me.try_start().await;
                        }
                    });
                }
            } else {
                self.ctx
                    .ui
                    .set_transcript("Press listen to start...", TranscriptState::Idle);
                if self.ctx.session.is_connectedish() {
                    self.ctx
                        .session
                        .transition(SessionPhase::Connected, "assistant finished, not listening");
                }
            }
        }
    }
}
