//! The four voice capabilities, behind the common `TtsVoice` contract.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{keys, Settings};
use crate::error::TtsError;

use super::{AudioSink, TtsVoice};

fn default_player() -> &'static str {
    if cfg!(target_os = "macos") {
        "afplay"
    } else {
        "aplay"
    }
}

fn default_synth() -> &'static str {
    if cfg!(target_os = "macos") {
        "say"
    } else {
        "espeak"
    }
}

/// Plays audio bytes by handing a temp file to the platform player process.
/// `stop` cancels the current playback token; the child is killed and the
/// call resolves with `Halted`.
pub struct ProcessAudioSink {
    settings: Arc<dyn Settings>,
    current: Mutex<Option<CancellationToken>>,
}

impl ProcessAudioSink {
    pub fn new(settings: Arc<dyn Settings>) -> Self {
        Self {
            settings,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AudioSink for ProcessAudioSink {
    async fn play(&self, audio: Vec<u8>) -> Result<(), TtsError> {
        let player = self.settings.get_or(keys::PLAYER_COMMAND, default_player());
        let path = std::env::temp_dir().join(format!("vigil-{}.wav", Uuid::new_v4()));
        tokio::fs::write(&path, &audio)
            .await
            .map_err(|e| TtsError::Playback(e.to_string()))?;

        let token = CancellationToken::new();
        *self.current.lock().expect("sink lock") = Some(token.clone());

        let spawned = tokio::process::Command::new(&player)
            .arg(&path)
            .kill_on_drop(true)
            .spawn();
        let result = match spawned {
            Ok(mut child) => {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(s) if s.success() => Ok(()),
                        Ok(s) => Err(TtsError::Playback(format!("player exited with {s}"))),
                        Err(e) => Err(TtsError::Playback(e.to_string())),
                    },
                    _ = token.cancelled() => {
                        let _ = child.kill().await;
                        Err(TtsError::Halted)
                    }
                }
            }
            Err(e) => Err(TtsError::Playback(format!("spawn {player}: {e}"))),
        };

        let _ = tokio::fs::remove_file(&path).await;
        let _ = self.current.lock().expect("sink lock").take();
        result
    }

    fn stop(&self) {
        if let Some(token) = self.current.lock().expect("sink lock").take() {
            token.cancel();
        }
    }

    fn is_playing(&self) -> bool {
        self.current.lock().expect("sink lock").is_some()
    }
}

/// With the realtime backend the peer speaks on its own remote audio track;
/// there is nothing to synthesize locally.
pub struct RemoteTrackVoice;

#[async_trait]
impl TtsVoice for RemoteTrackVoice {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn speak(&self, _text: &str) -> Result<(), TtsError> {
        Ok(())
    }

    fn halt(&self) {}
}

/// Third-party hosted voice over HTTP.
pub struct HostedHttpVoice {
    client: reqwest::Client,
    settings: Arc<dyn Settings>,
    sink: Arc<dyn AudioSink>,
}

impl HostedHttpVoice {
    pub fn new(settings: Arc<dyn Settings>, sink: Arc<dyn AudioSink>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            settings,
            sink,
        }
    }
}

#[async_trait]
impl TtsVoice for HostedHttpVoice {
    fn name(&self) -> &'static str {
        "hosted"
    }

    async fn speak(&self, text: &str) -> Result<(), TtsError> {
        let api_key = self
            .settings
            .get(keys::TTS_API_KEY)
            .filter(|k| !k.trim().is_empty())
            .ok_or(TtsError::MissingCredential("tts_api_key"))?;
        let voice = self.settings.get_or(keys::TTS_VOICE, "21m00Tcm4TlvDq8ikWAM");
        let endpoint = self.settings.get_or(
            keys::HOSTED_TTS_ENDPOINT,
            "https://api.elevenlabs.io/v1/text-to-speech",
        );

        let response = self
            .client
            .post(format!("{endpoint}/{voice}"))
            .header("xi-api-key", api_key.trim())
            .json(&json!({
                "text": text,
                "model_id": "eleven_turbo_v2_5",
                "voice_settings": { "stability": 0.5, "similarity_boost": 0.75 },
            }))
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::Request(format!("{status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        self.sink.play(audio.to_vec()).await
    }

    fn halt(&self) {
        self.sink.stop();
    }
}

/// Local HTTP voice service (self-hosted synthesizer on the kiosk).
pub struct LocalHttpVoice {
    client: reqwest::Client,
    settings: Arc<dyn Settings>,
    sink: Arc<dyn AudioSink>,
}

impl LocalHttpVoice {
    pub fn new(settings: Arc<dyn Settings>, sink: Arc<dyn AudioSink>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            settings,
            sink,
        }
    }
}

#[async_trait]
impl TtsVoice for LocalHttpVoice {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn speak(&self, text: &str) -> Result<(), TtsError> {
        let endpoint = self
            .settings
            .get_or(keys::LOCAL_TTS_ENDPOINT, "http://localhost:5002/api/tts");
        let response = self
            .client
            .post(&endpoint)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::Request(format!("{status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        self.sink.play(audio.to_vec()).await
    }

    fn halt(&self) {
        self.sink.stop();
    }
}

/// Platform synthesizer: spawn the OS voice command per utterance.
pub struct PlatformVoice {
    settings: Arc<dyn Settings>,
    current: Mutex<Option<CancellationToken>>,
}

impl PlatformVoice {
    pub fn new(settings: Arc<dyn Settings>) -> Self {
        Self {
            settings,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TtsVoice for PlatformVoice {
    fn name(&self) -> &'static str {
        "platform"
    }

    async fn speak(&self, text: &str) -> Result<(), TtsError> {
        let command = self.settings.get_or(keys::SPEECH_COMMAND, default_synth());
        let token = CancellationToken::new();
        *self.current.lock().expect("voice lock") = Some(token.clone());

        let spawned = tokio::process::Command::new(&command)
            .arg(text)
            .kill_on_drop(true)
            .spawn();
        let result = match spawned {
            Ok(mut child) => {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(s) if s.success() => Ok(()),
                        Ok(s) => Err(TtsError::Playback(format!("{command} exited with {s}"))),
                        Err(e) => Err(TtsError::Playback(e.to_string())),
                    },
                    _ = token.cancelled() => {
                        let _ = child.kill().await;
                        Err(TtsError::Halted)
                    }
                }
            }
            Err(e) => Err(TtsError::Playback(format!("spawn {command}: {e}"))),
        };

        let _ = self.current.lock().expect("voice lock").take();
        result
    }

    fn halt(&self) {
        if let Some(token) = self.current.lock().expect("voice lock").take() {
            token.cancel();
        }
    }
}
