use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("control channel is not open")]
    NotOpen,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Benign race: the engine was already running when start was called.
    #[error("capture engine already running")]
    AlreadyRunning,
    #[error("no capture engine attached")]
    NoEngine,
    #[error("capture engine start failed: {0}")]
    StartFailed(String),
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("voice request failed: {0}")]
    Request(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("playback halted")]
    Halted,
}

/// Last-resort self-healing: the supervisor asks the host binary to tear the
/// whole client down and start over. Sent after a retry ceiling is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ReconnectExhausted,
    CaptureExhausted,
}
