use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Plain key/value settings. Values are read fresh on every operation; the
/// core never caches them, so an operator can repoint endpoints or swap
/// providers without a restart.
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn enabled(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.trim(), "1" | "true" | "on" | "yes"),
            None => default,
        }
    }
}

/// Well-known settings keys.
pub mod keys {
    pub const BACKEND: &str = "backend";
    pub const API_KEY: &str = "api_key";
    pub const MODEL: &str = "model";
    pub const VOICE_ID: &str = "voice_id";
    pub const SESSION_ENDPOINT: &str = "session_endpoint";
    pub const SDP_ENDPOINT: &str = "sdp_endpoint";
    pub const CHAT_ENDPOINT: &str = "chat_endpoint";
    pub const CHAT_MODEL: &str = "chat_model";
    pub const TTS_PROVIDER: &str = "tts_provider";
    pub const TTS_API_KEY: &str = "tts_api_key";
    pub const TTS_VOICE: &str = "tts_voice";
    pub const HOSTED_TTS_ENDPOINT: &str = "hosted_tts_endpoint";
    pub const LOCAL_TTS_ENDPOINT: &str = "local_tts_endpoint";
    pub const PLAYER_COMMAND: &str = "player_command";
    pub const SPEECH_COMMAND: &str = "speech_command";
    pub const USE_SPEECH: &str = "use_speech";
    pub const LISTEN_WHILE_SPEAKING: &str = "listen_while_speaking";
    pub const INSTRUCTIONS: &str = "instructions";
}

/// Reads settings from the process environment, uppercased and prefixed with
/// `VIGIL_` (`api_key` -> `VIGIL_API_KEY`). Every lookup hits the
/// environment so edits to a wrapper script take effect on the next call.
pub struct EnvSettings;

impl Settings for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        let var = format!("VIGIL_{}", key.to_ascii_uppercase());
        std::env::var(var).ok()
    }
}

/// In-memory settings, mainly for tests and embedding hosts.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .expect("settings lock")
            .insert(key.to_string(), value.to_string());
    }
}

impl Settings for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().expect("settings lock").get(key).cloned()
    }
}

/// Which conversational backend carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Duplex real-time transport negotiated through a signaling exchange.
    Realtime,
    /// Plain request/response HTTP chat; no persistent transport to lose.
    Direct,
}

/// Whether capture keeps running while the assistant speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakingPolicy {
    /// Keep the engine hot and match recognized text against the
    /// interruption phrase list.
    BargeIn,
    /// Pause the engine for the duration of playback, restart after.
    MutedWhileSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceProviderKind {
    /// Audio arrives on the transport's remote track; nothing to synthesize
    /// locally.
    Realtime,
    Hosted,
    Platform,
    LocalHttp,
}

pub fn backend_kind(settings: &dyn Settings) -> BackendKind {
    match settings.get_or(keys::BACKEND, "realtime").as_str() {
        "direct" => BackendKind::Direct,
        _ => BackendKind::Realtime,
    }
}

pub fn speaking_policy(settings: &dyn Settings) -> SpeakingPolicy {
    if settings.enabled(keys::LISTEN_WHILE_SPEAKING, true) {
        SpeakingPolicy::BargeIn
    } else {
        SpeakingPolicy::MutedWhileSpeaking
    }
}

pub fn voice_provider_kind(settings: &dyn Settings) -> VoiceProviderKind {
    match settings.get_or(keys::TTS_PROVIDER, "realtime").as_str() {
        "hosted" => VoiceProviderKind::Hosted,
        "platform" => VoiceProviderKind::Platform,
        "local" => VoiceProviderKind::LocalHttp,
        _ => VoiceProviderKind::Realtime,
    }
}

/// Numeric tuning values. These are deployment knobs, not logic; tests
/// shrink them to keep scenarios fast.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Silence that ends an utterance once the word floor is met.
    pub silence_window: Duration,
    /// Minimum words before an utterance is eligible to send.
    pub min_words_for_send: usize,

    pub base_capture_retry_delay: Duration,
    pub max_capture_retry_delay: Duration,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,

    pub capture_watchdog_interval: Duration,
    pub capture_health_interval: Duration,
    pub connection_monitor_interval: Duration,

    /// Hard ceiling on one TTS utterance before the flag is forced clear.
    pub max_speaking_duration: Duration,
    /// Bound on a single streamed sentence's playback call.
    pub sentence_timeout: Duration,
    /// Bound on each signaling HTTP call.
    pub signaling_timeout: Duration,
    /// Bound on a direct-backend chat request.
    pub chat_timeout: Duration,
    /// Bound on one engine start/stop call; a hung engine must not wedge
    /// a public entry point.
    pub engine_call_timeout: Duration,
    /// Delay before capture restarts after the assistant stops speaking.
    pub capture_resume_delay: Duration,

    pub max_reconnect_attempts: u32,
    pub max_capture_retry_attempts: u32,
    /// Grace before the requested full-client restart is delivered.
    pub restart_delay: Duration,

    /// Direct backend keeps this many prior exchanges as context.
    pub max_history_exchanges: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            silence_window: Duration::from_millis(1000),
            min_words_for_send: 2,
            base_capture_retry_delay: Duration::from_millis(500),
            max_capture_retry_delay: Duration::from_secs(10),
            base_reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            capture_watchdog_interval: Duration::from_secs(5),
            capture_health_interval: Duration::from_secs(10),
            connection_monitor_interval: Duration::from_secs(5),
            max_speaking_duration: Duration::from_secs(60),
            sentence_timeout: Duration::from_secs(30),
            signaling_timeout: Duration::from_secs(15),
            chat_timeout: Duration::from_secs(120),
            engine_call_timeout: Duration::from_secs(5),
            capture_resume_delay: Duration::from_millis(500),
            max_reconnect_attempts: 20,
            max_capture_retry_attempts: 10,
            restart_delay: Duration::from_secs(5),
            max_history_exchanges: 6,
        }
    }
}

/// Exponential backoff, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(cap)
}
