//! Transport lifecycle: connect, monitor, reconnect with backoff, hang up.
//! Also reconciles per-turn response identifiers and drives capture and
//! playback around each turn.

pub mod transport;
pub mod turns;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::capture::CaptureLoop;
use crate::config::{self, backoff_delay, keys, BackendKind};
use crate::context::SessionContext;
use crate::error::{RestartReason, TransportError};
use crate::events::SessionEvent;
use crate::session::{SessionFlag, SessionPhase};
use crate::ui::{ControlMode, TranscriptState};
use crate::voice::pipeline::StreamingPipeline;
use crate::voice::VoiceRouter;
use crate::watchdog::names;

use transport::{
    DuplexTransport, InboundMessage, PeerLink, Signaling, TransportEvent, TransportFactory,
};
use turns::TurnLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
struct Exchange {
    role: Role,
    content: String,
}

struct LinkState {
    transport: Option<Arc<dyn DuplexTransport>>,
    /// The direct backend has no persistent transport; connection is
    /// synthesized and verified per-request instead.
    direct_ready: bool,
    attempts: u32,
    /// At most one reconnect may be scheduled at any instant.
    retry_pending: bool,
    /// Bumped on hangup and on each new transport; stale retries and event
    /// pumps see the mismatch and stand down.
    epoch: u64,
    ledger: TurnLedger,
    history: VecDeque<Exchange>,
}

pub struct ConnectionSupervisor {
    ctx: SessionContext,
    weak: Weak<ConnectionSupervisor>,
    capture: Arc<CaptureLoop>,
    pipeline: Arc<StreamingPipeline>,
    voice: Arc<VoiceRouter>,
    signaling: Arc<dyn Signaling>,
    transport_factory: Arc<dyn TransportFactory>,
    http: reqwest::Client,
    restart_tx: mpsc::Sender<RestartReason>,
    inner: Mutex<LinkState>,
}

impl ConnectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: SessionContext,
        capture: Arc<CaptureLoop>,
        pipeline: Arc<StreamingPipeline>,
        voice: Arc<VoiceRouter>,
        signaling: Arc<dyn Signaling>,
        transport_factory: Arc<dyn TransportFactory>,
        restart_tx: mpsc::Sender<RestartReason>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ctx,
            weak: weak.clone(),
            capture,
            pipeline,
            voice,
            signaling,
            transport_factory,
            http: reqwest::Client::new(),
            restart_tx,
            inner: Mutex::new(LinkState {
                transport: None,
                direct_ready: false,
                attempts: 0,
                retry_pending: false,
                epoch: 0,
                ledger: TurnLedger::new(),
                history: VecDeque::new(),
            }),
        })
    }

    fn me(&self) -> Arc<Self> {
        self.weak.upgrade().expect("supervisor alive")
    }

    /// Completed utterances from the capture loop become outbound turns.
    pub fn spawn_utterance_pump(&self, mut utterances: mpsc::Receiver<String>) {
        let me = self.me();
        tokio::spawn(async move {
            while let Some(text) = utterances.recv().await {
                me.send_text(&text).await;
            }
        });
    }

    /// Open (or re-open) the session. Any failure besides a missing
    /// credential folds into the reconnect path.
    pub async fn connect(&self) {
        match self.establish().await {
            Ok(()) => {}
            Err(TransportError::MissingCredential(key)) => {
                // Configuration error: surface once and go back to Idle.
                self.ctx.ui.toast("missing credential");
                self.ctx
                    .ui
                    .log(&format!("[conn] missing credential: {key}"));
                self.ctx
                    .session
                    .set_flag(SessionFlag::WantsConnected, false);
                self.ctx
                    .session
                    .transition(SessionPhase::Idle, "missing credential");
                self.ctx.bus.publish(SessionEvent::ConnectionFailed {
                    error: format!("missing credential: {key}"),
                });
            }
            Err(e) => {
                self.ctx.ui.log(&format!("[conn] connection error: {e}"));
                self.ctx.ui.toast("connection failed");
                self.ctx.bus.publish(SessionEvent::ConnectionFailed {
                    error: e.to_string(),
                });
                self.ctx
                    .session
                    .transition(SessionPhase::Error, "connection error");
                if self.ctx.session.flag(SessionFlag::WantsConnected) {
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn establish(&self) -> Result<(), TransportError> {
        self.ctx.session.set_flag(SessionFlag::WantsConnected, true);
        self.ctx.bus.publish(SessionEvent::ConnectionRequested);

        // Recovery takes priority over strict sequencing: if the checked
        // transition is rejected, force it.
        if !self
            .ctx
            .session
            .transition(SessionPhase::Connecting, "connect requested")
        {
            self.ctx
                .ui
                .log("[conn] forcing connecting state for recovery");
            self.ctx
                .session
                .force(SessionPhase::Connecting, "forced for recovery");
        }

        self.ctx.ui.set_controls(ControlMode::Busy);

        match config::backend_kind(self.ctx.settings.as_ref()) {
            BackendKind::Direct => {
                self.ctx.ui.toast("connecting (direct)...");
                {
                    let mut link = self.inner.lock().expect("link lock");
                    link.direct_ready = true;
                    link.attempts = 0;
                }
                self.ctx.ui.set_controls(ControlMode::Connected);
                self.ctx.ui.toast("connected (direct)");
                self.ctx.ui.log("[conn] connected to direct backend");
                self.ctx
                    .session
                    .transition(SessionPhase::Connected, "direct backend connected");
                self.ctx.bus.publish(SessionEvent::ConnectionEstablished {
                    backend: BackendKind::Direct,
                });
                self.start_liveness_watchdog();
                Ok(())
            }
            BackendKind::Realtime => {
                self.ctx.ui.toast("connecting...");
                let (transport, events) = self.transport_factory.create().await?;
                let epoch = {
                    let mut link = self.inner.lock().expect("link lock");
                    link.epoch += 1;
                    // A sleeping retry from the previous epoch is obsolete;
                    // it must not leave the pending flag wedged.
                    link.retry_pending = false;
                    if let Some(old) = link.transport.replace(Arc::clone(&transport)) {
                        old.close();
                    }
                    link.epoch
                };
                self.spawn_event_pump(events, epoch);

                let offer = transport.create_offer().await?;
                let bound = self.ctx.tuning.signaling_timeout;
                let grant = timeout(bound, self.signaling.create_session())
                    .await
                    .map_err(|_| {
                        TransportError::Signaling("session request timed out".to_string())
                    })??;
                let answer = timeout(bound, self.signaling.exchange_offer(&grant, &offer))
                    .await
                    .map_err(|_| {
                        TransportError::Signaling("sdp exchange timed out".to_string())
                    })??;
                transport.apply_answer(&answer).await?;
                timeout(bound, transport.wait_channel_open())
                    .await
                    .map_err(|_| {
                        TransportError::Negotiation("control channel open timed out".to_string())
                    })??;

                self.inner.lock().expect("link lock").attempts = 0;
                self.ctx.ui.set_controls(ControlMode::Connected);
                self.ctx.ui.toast("connected");
                self.ctx.ui.log("[conn] connected via realtime transport");
                self.ctx
                    .session
                    .transition(SessionPhase::Connected, "realtime transport connected");
                self.ctx.bus.publish(SessionEvent::ConnectionEstablished {
                    backend: BackendKind::Realtime,
                });
                self.start_liveness_watchdog();
                Ok(())
            }
        }
    }

    fn start_liveness_watchdog(&self) {
        let live = self.me();
        let dead = self.me();
        self.ctx.watchdogs.start_connection_monitor(
            Arc::clone(&self.ctx.session),
            move || live.is_connected(),
            move || dead.schedule_reconnect(),
        );
    }

    fn spawn_event_pump(&self, mut events: mpsc::Receiver<TransportEvent>, epoch: u64) {
        let me = self.me();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if me.inner.lock().expect("link lock").epoch != epoch {
                    break;
                }
                me.handle_transport_event(event).await;
            }
        });
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelOpen => {
                self.inner.lock().expect("link lock").attempts = 0;
                self.ctx.ui.log("[conn] control channel open");
            }
            TransportEvent::ChannelClosed { reason } => {
                self.ctx
                    .ui
                    .log(&format!("[conn] control channel closed: {reason}"));
                if self.ctx.session.flag(SessionFlag::WantsConnected) {
                    self.ctx
                        .ui
                        .log("[conn] unexpected close, scheduling reconnect");
                    self.ctx
                        .bus
                        .publish(SessionEvent::ConnectionLost { reason });
                    self.schedule_reconnect();
                }
            }
            TransportEvent::ChannelError { error } => {
                self.ctx.ui.log(&format!("[conn] channel error: {error}"));
                self.ctx.bus.publish(SessionEvent::Error {
                    source: "transport",
                    error,
                });
                if self.ctx.session.flag(SessionFlag::WantsConnected) {
                    self.schedule_reconnect();
                }
            }
            TransportEvent::PeerState(PeerLink::Connected) => {
                self.inner.lock().expect("link lock").attempts = 0;
                self.ctx.ui.log("[conn] peer link connected");
            }
            TransportEvent::PeerState(state) => {
                self.ctx.ui.log(&format!("[conn] peer link {state:?}"));
                self.ctx.bus.publish(SessionEvent::ConnectionLost {
                    reason: format!("peer {state:?}"),
                });
                if self.ctx.session.flag(SessionFlag::WantsConnected) {
                    self.cleanup_transport();
                    self.schedule_reconnect();
                }
            }
            TransportEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::TextDelta { response_id, delta } => {
                let rid = {
                    let mut link = self.inner.lock().expect("link lock");
                    link.ledger.resolve(response_id.as_deref())
                };
                if self.voice.speech_enabled() && !self.voice.remote_audio() {
                    self.pipeline.push_delta(&rid, &delta);
                }
            }
            InboundMessage::PartDone { response_id, text } => {
                let mut link = self.inner.lock().expect("link lock");
                let rid = link.ledger.resolve(response_id.as_deref());
                link.ledger.append_text(&rid, &text);
            }
            InboundMessage::RateLimit { remaining, limit } => {
                self.ctx
                    .ui
                    .log(&format!("[conn] rate limit: {remaining}/{limit} tokens"));
            }
            InboundMessage::TurnComplete { response_id, usage } => {
                let (rid, turn) = {
                    let mut link = self.inner.lock().expect("link lock");
                    let rid = link.ledger.resolve(response_id.as_deref());
                    let turn = link.ledger.complete(&rid, usage);
                    (rid, turn)
                };
                let text = turn.text.trim().to_string();
                if !text.is_empty() {
                    self.ctx.ui.log(&format!("[assistant] {text}"));
                }
                self.ctx.ui.add_exchange(
                    "assistant",
                    &text,
                    turn.usage.input_tokens,
                    turn.usage.output_tokens,
                );
                self.ctx.bus.publish(SessionEvent::AssistantResponse {
                    text: text.clone(),
                    input_tokens: turn.usage.input_tokens,
                    output_tokens: turn.usage.output_tokens,
                });

                let streamed = self.pipeline.is_streaming(&rid);
                if streamed {
                    // Flush whatever partial sentence remains for playback.
                    self.pipeline.finish_turn();
                } else if self.voice.speech_enabled()
                    && !self.voice.remote_audio()
                    && !text.is_empty()
                {
                    self.voice.speak_detached(text);
                }
                self.ctx.ui.log("[conn] turn complete");
            }
            InboundMessage::Other => {}
        }
    }

    /// Schedule exactly one retry, or escalate to a full client restart once
    /// the ceiling is hit. The attempt counter only resets on a confirmed
    /// live connection.
    pub fn schedule_reconnect(&self) {
        if !self.ctx.session.flag(SessionFlag::WantsConnected) {
            return;
        }
        let max = self.ctx.tuning.max_reconnect_attempts;
        let scheduled = {
            let mut link = self.inner.lock().expect("link lock");
            if link.retry_pending {
                return;
            }
            if link.attempts >= max {
                None
            } else {
                let delay = backoff_delay(
                    self.ctx.tuning.base_reconnect_delay,
                    self.ctx.tuning.max_reconnect_delay,
                    link.attempts,
                );
                link.attempts += 1;
                link.retry_pending = true;
                Some((link.attempts, delay, link.epoch))
            }
        };

        let Some((attempt, delay, epoch)) = scheduled else {
            self.ctx.ui.log(&format!(
                "[conn] CRITICAL: max reconnect attempts ({max}) exceeded"
            ));
            self.ctx.ui.toast("restarting client...");
            self.ctx.bus.publish(SessionEvent::Fatal {
                source: "connection",
                error: "max reconnect attempts exceeded".to_string(),
            });
            let tx = self.restart_tx.clone();
            let grace = self.ctx.tuning.restart_delay;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(RestartReason::ReconnectExhausted).await;
            });
            return;
        };

        self.ctx.ui.log(&format!(
            "[conn] scheduling reconnect in {}ms (attempt {attempt}/{max})",
            delay.as_millis()
        ));
        self.ctx.ui.toast("reconnecting...");
        self.ctx
            .session
            .transition(SessionPhase::Reconnecting, "scheduling reconnect");
        self.ctx
            .bus
            .publish(SessionEvent::ReconnectScheduled { attempt, delay });

        let me = self.me();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut link = me.inner.lock().expect("link lock");
                if link.epoch != epoch {
                    return;
                }
                link.retry_pending = false;
            }
            if me.ctx.session.flag(SessionFlag::WantsConnected) && !me.is_connected() {
                me.ctx.ui.log("[conn] attempting reconnect...");
                me.connect().await;
            }
        });
    }

    fn cleanup_transport(&self) {
        let transport = self.inner.lock().expect("link lock").transport.take();
        if let Some(transport) = transport {
            transport.close();
        }
    }

    /// Actual liveness, deliberately not the state label.
    pub fn is_connected(&self) -> bool {
        let link = self.inner.lock().expect("link lock");
        if let Some(transport) = &link.transport {
            if transport.is_open() {
                return true;
            }
        }
        link.direct_ready
    }

    pub async fn send_text(&self, text: &str) {
        if !self.is_connected() {
            return;
        }
        match config::backend_kind(self.ctx.settings.as_ref()) {
            BackendKind::Realtime => self.send_realtime(text),
            BackendKind::Direct => self.send_direct(text).await,
        }
    }

    fn send_realtime(&self, text: &str) {
        let transport = self.inner.lock().expect("link lock").transport.clone();
        let Some(transport) = transport else {
            return;
        };
        let modalities = if self.voice.remote_audio() {
            vec!["audio", "text"]
        } else {
            vec!["text"]
        };
        let messages = [
            json!({ "type": "user_message", "text": text }),
            json!({ "type": "response_request", "modalities": modalities }),
        ];
        for message in messages {
            if let Err(e) = transport.send(message) {
                self.ctx.ui.log(&format!("[conn] send failed: {e}"));
                return;
            }
        }
        self.ctx.ui.log(&format!("[you] {text}"));
        self.ctx.ui.add_exchange("user", text, 0, 0);
    }

    async fn send_direct(&self, text: &str) {
        let endpoint = self
            .ctx
            .settings
            .get_or(keys::CHAT_ENDPOINT, "http://localhost:11434/api/generate");
        let model = self.ctx.settings.get_or(keys::CHAT_MODEL, "llama2");

        // History context excludes the utterance being sent.
        let prompt = self.build_prompt(text);
        {
            let mut link = self.inner.lock().expect("link lock");
            link.history.push_back(Exchange {
                role: Role::User,
                content: text.to_string(),
            });
            Self::trim_history(&mut link.history, self.ctx.tuning.max_history_exchanges);
        }

        self.ctx.ui.log(&format!("[you] {text}"));
        self.ctx.ui.add_exchange("user", text, 0, 0);
        self.ctx.ui.log(&format!("[direct] sending to {endpoint}"));
        self.ctx
            .ui
            .set_transcript("Thinking...", TranscriptState::Waiting);

        let started = Instant::now();
        let request = self
            .http
            .post(&endpoint)
            .json(&json!({ "model": model, "prompt": prompt, "stream": false }))
            .send();

        let response = match timeout(self.ctx.tuning.chat_timeout, request).await {
            Err(_) => {
                self.ctx.ui.log("[direct] request timed out");
                self.ctx.ui.toast("chat timeout");
                self.ctx.bus.publish(SessionEvent::Error {
                    source: "direct",
                    error: "request timed out".to_string(),
                });
                self.ctx
                    .ui
                    .set_transcript("Listening...", TranscriptState::Listening);
                return;
            }
            Ok(Err(e)) => {
                self.ctx.ui.log(&format!("[direct] error: {e}"));
                self.ctx.bus.publish(SessionEvent::Error {
                    source: "direct",
                    error: e.to_string(),
                });
                self.ctx
                    .ui
                    .set_transcript("Listening...", TranscriptState::Listening);
                return;
            }
            Ok(Ok(response)) => response,
        };

        self.ctx.ui.log(&format!(
            "[direct] response received in {:.1}s",
            started.elapsed().as_secs_f32()
        ));

        if !response.status().is_success() {
            let status = response.status();
            self.ctx.ui.log(&format!("[direct] error: {status}"));
            self.ctx.bus.publish(SessionEvent::Error {
                source: "direct",
                error: status.to_string(),
            });
            self.ctx
                .ui
                .set_transcript("Listening...", TranscriptState::Listening);
            return;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                self.ctx.ui.log(&format!("[direct] bad response: {e}"));
                self.ctx
                    .ui
                    .set_transcript("Listening...", TranscriptState::Listening);
                return;
            }
        };

        let reply = ["response", "text", "content"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .trim()
            .to_string();
        if reply.is_empty() {
            self.ctx.ui.log("[direct] empty response");
            self.ctx
                .ui
                .set_transcript("Listening...", TranscriptState::Listening);
            return;
        }

        {
            let mut link = self.inner.lock().expect("link lock");
            link.history.push_back(Exchange {
                role: Role::Assistant,
                content: reply.clone(),
            });
            Self::trim_history(&mut link.history, self.ctx.tuning.max_history_exchanges);
        }

        self.ctx.ui.log(&format!("[assistant] {reply}"));
        self.ctx.ui.add_exchange("assistant", &reply, 0, 0);
        self.ctx.bus.publish(SessionEvent::AssistantResponse {
            text: reply.clone(),
            input_tokens: 0,
            output_tokens: 0,
        });

        if self.voice.speech_enabled() && !self.voice.remote_audio() {
            self.voice.speak_detached(reply);
        } else {
            self.ctx
                .ui
                .set_transcript("Listening...", TranscriptState::Listening);
        }
    }

    fn build_prompt(&self, text: &str) -> String {
        let mut prompt = String::new();
        let instructions = self.ctx.settings.get_or(keys::INSTRUCTIONS, "");
        if !instructions.is_empty() {
            prompt.push_str(&instructions);
            prompt.push_str("\n\n");
        }
        {
            let link = self.inner.lock().expect("link lock");
            for exchange in &link.history {
                let speaker = match exchange.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                prompt.push_str(&format!("{speaker}: {}\n", exchange.content));
            }
        }
        prompt.push_str(&format!("User: {text}\nAssistant:"));
        prompt
    }

    fn trim_history(history: &mut VecDeque<Exchange>, max: usize) {
        while history.len() > max {
            history.pop_front();
        }
    }

    /// Intentional disconnect: no auto-reconnect afterwards. Reachable from
    /// any phase.
    pub async fn hangup(&self) {
        self.ctx
            .session
            .set_flag(SessionFlag::WantsConnected, false);
        {
            let mut link = self.inner.lock().expect("link lock");
            link.attempts = 0;
            link.retry_pending = false;
            link.epoch += 1;
            link.history.clear();
            link.ledger.clear();
            link.direct_ready = false;
            if let Some(transport) = link.transport.take() {
                transport.close();
            }
        }
        self.ctx.watchdogs.stop(names::CONNECTION_MONITOR);
        self.capture.stop().await;
        self.pipeline.interrupt();
        self.voice.halt();

        self.ctx
            .session
            .transition(SessionPhase::Idle, "user hangup");
        self.ctx.bus.publish(SessionEvent::Disconnected);
        self.ctx.ui.set_controls(ControlMode::Idle);
        self.ctx.ui.toast("idle");
        self.ctx.ui.log("[conn] disconnected");
    }
}
