//! The duplex transport and signaling seams. The concrete peer stack and
//! the backend's wire format live outside this crate; the supervisor sees
//! negotiation primitives, a control channel, and already-shaped inbound
//! events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{keys, Settings};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLink {
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Inbound protocol events, already lifted out of the backend's wire
/// format by the transport adapter.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Streaming reply text for low-latency playback.
    TextDelta {
        response_id: Option<String>,
        delta: String,
    },
    /// A completed content part; accumulated into the turn's text.
    PartDone {
        response_id: Option<String>,
        text: String,
    },
    /// The turn is finished.
    TurnComplete {
        response_id: Option<String>,
        usage: Usage,
    },
    RateLimit {
        remaining: u64,
        limit: u64,
    },
    /// Anything the adapter does not recognize; ignored.
    Other,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    ChannelOpen,
    ChannelClosed { reason: String },
    ChannelError { error: String },
    PeerState(PeerLink),
    Message(InboundMessage),
}

/// A negotiated peer connection with a control channel.
#[async_trait]
pub trait DuplexTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;
    async fn apply_answer(&self, answer: &str) -> Result<(), TransportError>;
    /// Resolves once the control channel is open.
    async fn wait_channel_open(&self) -> Result<(), TransportError>;
    fn send(&self, payload: serde_json::Value) -> Result<(), TransportError>;
    /// Actual liveness, not what the state machine believes.
    fn is_open(&self) -> bool;
    fn close(&self);
}

/// Builds a fresh transport per connection attempt, along with its event
/// stream.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn DuplexTransport>, mpsc::Receiver<TransportEvent>), TransportError>;
}

/// Deployments without a realtime stack compiled in: the direct backend
/// still works, realtime connects fail into the normal reconnect path.
pub struct NoRealtimeTransport;

#[async_trait]
impl TransportFactory for NoRealtimeTransport {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn DuplexTransport>, mpsc::Receiver<TransportEvent>), TransportError> {
        Err(TransportError::Negotiation(
            "no realtime transport configured".to_string(),
        ))
    }
}

pub struct SessionGrant {
    pub token: String,
}

/// The signaling exchange that turns a local offer into a remote answer.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn create_session(&self) -> Result<SessionGrant, TransportError>;
    async fn exchange_offer(
        &self,
        grant: &SessionGrant,
        offer_sdp: &str,
    ) -> Result<String, TransportError>;
}

/// HTTP signaling against the backend's session + SDP endpoints.
pub struct HttpSignaling {
    client: reqwest::Client,
    settings: Arc<dyn Settings>,
}

impl HttpSignaling {
    pub fn new(settings: Arc<dyn Settings>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            settings,
        }
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn create_session(&self) -> Result<SessionGrant, TransportError> {
        let api_key = self
            .settings
            .get(keys::API_KEY)
            .filter(|k| !k.trim().is_empty())
            .ok_or(TransportError::MissingCredential("api_key"))?;
        let endpoint = self.settings.get_or(
            keys::SESSION_ENDPOINT,
            "https://api.openai.com/v1/realtime/sessions",
        );
        let model = self.settings.get_or(keys::MODEL, "gpt-realtime");
        let voice = self.settings.get_or(keys::VOICE_ID, "alloy");
        let instructions = self.settings.get_or(keys::INSTRUCTIONS, "");

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(api_key.trim())
            .json(&serde_json::json!({
                "model": model,
                "voice": voice,
                "output_audio_format": "pcm16",
                "instructions": instructions,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Signaling(format!("session: {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        let token = body
            .get("client_secret")
            .map(|secret| {
                secret
                    .get("value")
                    .and_then(|v| v.as_str())
                    .or_else(|| secret.as_str())
                    .unwrap_or_default()
                    .to_string()
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TransportError::Signaling("session grant missing token".to_string()))?;

        Ok(SessionGrant { token })
    }

    async fn exchange_offer(
        &self,
        grant: &SessionGrant,
        offer_sdp: &str,
    ) -> Result<String, TransportError> {
        let endpoint = self
            .settings
            .get_or(keys::SDP_ENDPOINT, "https://api.openai.com/v1/realtime");
        let model = self.settings.get_or(keys::MODEL, "gpt-realtime");

        let response = self
            .client
            .post(format!("{endpoint}?model={model}"))
            .bearer_auth(&grant.token)
            .header("Content-Type", "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Signaling(format!("sdp: {status}: {body}")));
        }

        response
            .text()
            .await
            .map_err(|e| TransportError::Signaling(e.to_string()))
    }
}
