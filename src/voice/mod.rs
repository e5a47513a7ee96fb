//! Text-to-speech capability family and the router that selects between
//! them. Playback is cooperative: one `CancellationToken` per sink is the
//! stopped flag; an in-flight call runs to completion but its effects are
//! discarded if it is found stale.

pub mod pipeline;
pub mod providers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::capture::SpeakingSink;
use crate::config::{self, VoiceProviderKind};
use crate::context::SessionContext;
use crate::error::TtsError;
use crate::events::SessionEvent;
use crate::watchdog::names;

/// One voice. `speak` resolves when playback finished or failed. It must
/// always resolve; a provider that can hang is wrapped in a timeout by its
/// caller.
#[async_trait]
pub trait TtsVoice: Send + Sync {
    fn name(&self) -> &'static str;
    async fn speak(&self, text: &str) -> Result<(), TtsError>;
    fn halt(&self);
}

/// Plays raw audio bytes. `stop` flips the cooperative stopped flag; the
/// current playback notices and bails.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Vec<u8>) -> Result<(), TtsError>;
    fn stop(&self);
    fn is_playing(&self) -> bool;
}

/// Selects the configured voice fresh on every call and guarantees that any
/// playback path, however it ends, clears the assistant-speaking flag.
pub struct VoiceRouter {
    ctx: SessionContext,
    speaking: Arc<dyn SpeakingSink>,
    realtime: Arc<dyn TtsVoice>,
    hosted: Arc<dyn TtsVoice>,
    platform: Arc<dyn TtsVoice>,
    local: Arc<dyn TtsVoice>,
}

impl VoiceRouter {
    pub fn new(ctx: SessionContext, speaking: Arc<dyn SpeakingSink>) -> Arc<Self> {
        let http_timeout = ctx.tuning.sentence_timeout;
        let sink: Arc<dyn AudioSink> =
            Arc::new(providers::ProcessAudioSink::new(Arc::clone(&ctx.settings)));
        Arc::new(Self {
            speaking,
            realtime: Arc::new(providers::RemoteTrackVoice),
            hosted: Arc::new(providers::HostedHttpVoice::new(
                Arc::clone(&ctx.settings),
                Arc::clone(&sink),
                http_timeout,
            )),
            platform: Arc::new(providers::PlatformVoice::new(Arc::clone(&ctx.settings))),
            local: Arc::new(providers::LocalHttpVoice::new(
                Arc::clone(&ctx.settings),
                Arc::clone(&sink),
                http_timeout,
            )),
            ctx,
        })
    }

    /// Router with injected voices; used by tests and embedders with their
    /// own audio stack.
    pub fn with_providers(
        ctx: SessionContext,
        speaking: Arc<dyn SpeakingSink>,
        realtime: Arc<dyn TtsVoice>,
        hosted: Arc<dyn TtsVoice>,
        platform: Arc<dyn TtsVoice>,
        local: Arc<dyn TtsVoice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            speaking,
            realtime,
            hosted,
            platform,
            local,
        })
    }

    fn current(&self) -> Arc<dyn TtsVoice> {
        match config::voice_provider_kind(self.ctx.settings.as_ref()) {
            VoiceProviderKind::Realtime => Arc::clone(&self.realtime),
            VoiceProviderKind::Hosted => Arc::clone(&self.hosted),
            VoiceProviderKind::Platform => Arc::clone(&self.platform),
            VoiceProviderKind::LocalHttp => Arc::clone(&self.local),
        }
    }

    pub fn speech_enabled(&self) -> bool {
        self.ctx.settings.enabled(crate::config::keys::USE_SPEECH, true)
    }

    /// The realtime voice speaks over the peer's own audio track; local
    /// synthesis stands down.
    pub fn remote_audio(&self) -> bool {
        self.speech_enabled()
            && config::voice_provider_kind(self.ctx.settings.as_ref())
                == VoiceProviderKind::Realtime
    }

    /// Speak one unit of text on the configured voice, resolving exactly
    /// once. Used by the streaming pipeline per sentence.
    pub async fn speak_streaming(&self, text: &str) -> Result<(), TtsError> {
        let voice = self.current();
        self.ctx.bus.publish(SessionEvent::TtsStarted {
            provider: voice.name(),
        });
        match voice.speak(text).await {
            Ok(()) => {
                self.ctx.bus.publish(SessionEvent::TtsEnded {
                    provider: voice.name(),
                });
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .ui
                    .log(&format!("[{}] error: {e}", voice.name()));
                self.ctx.bus.publish(SessionEvent::TtsError {
                    provider: voice.name(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Fire-and-forget full-reply playback. Owns the assistant-speaking flag
    /// for its duration; the speaking-timeout watchdog forces the flag clear
    /// if the provider never signals completion.
    pub fn speak_detached(self: &Arc<Self>, text: String) {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let voice = me.current();
            me.speaking.set_assistant_speaking(true);

            let timed_out = Arc::new(AtomicBool::new(false));
            {
                let voice = Arc::clone(&voice);
                let flag = Arc::clone(&timed_out);
                let watchdog_me = Arc::clone(&me);
                me.ctx.watchdogs.start_speaking_timeout(move || {
                    flag.store(true, Ordering::SeqCst);
                    watchdog_me
                        .ctx
                        .ui
                        .log("[voice] speaking timeout exceeded, forcing end");
                    voice.halt();
                    watchdog_me.speaking.set_assistant_speaking(false);
                });
            }

            let _ = me.speak_streaming(&text).await;
            me.ctx.watchdogs.stop(names::SPEAKING_TIMEOUT);
            if !timed_out.load(Ordering::SeqCst) {
                me.speaking.set_assistant_speaking(false);
            }
        });
    }

    /// Halt every provider. Idempotent; safe to call with nothing playing.
    pub fn halt(&self) {
        self.realtime.halt();
        self.hosted.halt();
        self.platform.halt();
        self.local.halt();
    }

    pub(crate) fn tuning_sentence_timeout(&self) -> Duration {
        self.ctx.tuning.sentence_timeout
    }
}
