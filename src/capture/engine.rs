//! The speech-to-text engine seam. The engine itself is an external
//! collaborator; the session only needs start/stop and a stream of events.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CaptureError;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Started,
    Ended,
    Result {
        text: String,
        is_final: bool,
        confidence: f32,
    },
    Error {
        kind: EngineErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Deliberate stop; not an error worth reacting to.
    Aborted,
    NoSpeech,
    Network,
    AudioCapture,
    NotAllowed,
    Other,
}

impl EngineErrorKind {
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            EngineErrorKind::NoSpeech | EngineErrorKind::Network | EngineErrorKind::AudioCapture
        )
    }
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Begin recognition. `Err(CaptureError::AlreadyRunning)` is the benign
    /// race where a previous run is still live; callers treat it as success.
    async fn start(&self) -> Result<(), CaptureError>;

    /// Stop recognition. The engine eventually emits `Ended`.
    async fn stop(&self);
}

/// An engine that accepts start/stop and never produces events. Lets the
/// rest of the session run headless (text-only deployments).
pub struct NullEngine;

#[async_trait]
impl SpeechEngine for NullEngine {
    async fn start(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn stop(&self) {}
}

pub type EngineEventSender = mpsc::Sender<EngineEvent>;
pub type EngineEventReceiver = mpsc::Receiver<EngineEvent>;

pub fn engine_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::channel(64)
}
