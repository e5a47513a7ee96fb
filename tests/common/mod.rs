//! Shared fakes and wiring for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use vigil::capture::endpoint::NoiseEstimate;
use vigil::capture::engine::{engine_channel, EngineEvent, EngineEventSender, SpeechEngine};
use vigil::config::{MemorySettings, Settings, Tuning};
use vigil::connection::transport::{
    DuplexTransport, SessionGrant, Signaling, TransportEvent, TransportFactory,
};
use vigil::error::{CaptureError, TransportError, TtsError};
use vigil::ui::{ControlMode, TranscriptState, UiSink};
use vigil::voice::TtsVoice;
use vigil::{
    CaptureLoop, ConnectionSupervisor, RestartReason, SessionContext, SessionEvent, SpeakingSink,
    StreamingPipeline, VoiceRouter,
};

// --- UI ---

#[derive(Default)]
pub struct RecordingUi {
    pub logs: Mutex<Vec<String>>,
    pub toasts: Mutex<Vec<String>>,
    pub transcripts: Mutex<Vec<(String, TranscriptState)>>,
    pub exchanges: Mutex<Vec<(String, String, u64, u64)>>,
}

impl RecordingUi {
    pub fn log_contains(&self, needle: &str) -> bool {
        self.logs.lock().unwrap().iter().any(|l| l.contains(needle))
    }
}

impl UiSink for RecordingUi {
    fn log(&self, line: &str) {
        self.logs.lock().unwrap().push(line.to_string());
    }

    fn toast(&self, message: &str) {
        self.toasts.lock().unwrap().push(message.to_string());
    }

    fn set_transcript(&self, text: &str, state: TranscriptState) {
        self.transcripts
            .lock()
            .unwrap()
            .push((text.to_string(), state));
    }

    fn add_exchange(&self, role: &str, text: &str, input_tokens: u64, output_tokens: u64) {
        self.exchanges.lock().unwrap().push((
            role.to_string(),
            text.to_string(),
            input_tokens,
            output_tokens,
        ));
    }

    fn set_controls(&self, _mode: ControlMode) {}
}

// --- noise ---

pub struct AdjustableNoise {
    pub level: Mutex<f32>,
}

impl AdjustableNoise {
    pub fn new(level: f32) -> Self {
        Self {
            level: Mutex::new(level),
        }
    }

    pub fn set(&self, level: f32) {
        *self.level.lock().unwrap() = level;
    }
}

impl NoiseEstimate for AdjustableNoise {
    fn ambient_level(&self) -> f32 {
        *self.level.lock().unwrap()
    }
}

// --- speech engine ---

pub struct FakeEngine {
    events: EngineEventSender,
    pub start_calls: Mutex<u32>,
    pub stop_calls: Mutex<u32>,
    /// Fail this many start attempts before succeeding.
    pub fail_starts: Mutex<u32>,
    /// Emit Started/Ended automatically on start/stop.
    pub auto_events: bool,
}

impl FakeEngine {
    pub fn new(events: EngineEventSender, auto_events: bool) -> Self {
        Self {
            events,
            start_calls: Mutex::new(0),
            stop_calls: Mutex::new(0),
            fail_starts: Mutex::new(0),
            auto_events,
        }
    }

    pub fn starts(&self) -> u32 {
        *self.start_calls.lock().unwrap()
    }

    pub fn stops(&self) -> u32 {
        *self.stop_calls.lock().unwrap()
    }
}

#[async_trait]
impl SpeechEngine for FakeEngine {
    async fn start(&self) -> Result<(), CaptureError> {
        *self.start_calls.lock().unwrap() += 1;
        {
            let mut fails = self.fail_starts.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(CaptureError::StartFailed("engine unavailable".to_string()));
            }
        }
        if self.auto_events {
            let _ = self.events.send(EngineEvent::Started).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        *self.stop_calls.lock().unwrap() += 1;
        if self.auto_events {
            let _ = self.events.send(EngineEvent::Ended).await;
        }
    }
}

// --- voice ---

pub struct FakeVoice {
    pub spoken: Mutex<Vec<String>>,
    pub speak_delay: Mutex<Duration>,
    /// Never signal completion; the caller's timeout has to save the day.
    pub hang: Mutex<bool>,
    pub halts: Mutex<u32>,
}

impl FakeVoice {
    pub fn new() -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            speak_delay: Mutex::new(Duration::from_millis(10)),
            hang: Mutex::new(false),
            halts: Mutex::new(0),
        }
    }

    pub fn spoken_sentences(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn set_hang(&self, hang: bool) {
        *self.hang.lock().unwrap() = hang;
    }
}

#[async_trait]
impl TtsVoice for FakeVoice {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn speak(&self, text: &str) -> Result<(), TtsError> {
        self.spoken.lock().unwrap().push(text.to_string());
        let (delay, hang) = (
            *self.speak_delay.lock().unwrap(),
            *self.hang.lock().unwrap(),
        );
        if hang {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        } else {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn halt(&self) {
        *self.halts.lock().unwrap() += 1;
    }
}

// --- transport + signaling ---

pub struct FakeTransport {
    pub open: Mutex<bool>,
    pub sent: Mutex<Vec<serde_json::Value>>,
}

impl FakeTransport {
    pub fn set_open(&self, open: bool) {
        *self.open.lock().unwrap() = open;
    }
}

#[async_trait]
impl DuplexTransport for FakeTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok("offer-sdp".to_string())
    }

    async fn apply_answer(&self, _answer: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn wait_channel_open(&self) -> Result<(), TransportError> {
        *self.open.lock().unwrap() = true;
        Ok(())
    }

    fn send(&self, payload: serde_json::Value) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    fn close(&self) {
        *self.open.lock().unwrap() = false;
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub event_handles: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl FakeTransportFactory {
    pub fn latest_transport(&self) -> Arc<FakeTransport> {
        self.transports.lock().unwrap().last().cloned().expect("a transport was created")
    }

    pub fn latest_events(&self) -> mpsc::Sender<TransportEvent> {
        self.event_handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a transport was created")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn DuplexTransport>, mpsc::Receiver<TransportEvent>), TransportError> {
        let transport = Arc::new(FakeTransport {
            open: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel(64);
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        self.event_handles.lock().unwrap().push(tx);
        Ok((transport, rx))
    }
}

pub struct FakeSignaling {
    /// Fail this many create_session calls before succeeding.
    pub fail_sessions: Mutex<u32>,
    pub missing_credential: Mutex<bool>,
    pub sessions_created: Mutex<u32>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self {
            fail_sessions: Mutex::new(0),
            missing_credential: Mutex::new(false),
            sessions_created: Mutex::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        *self.fail_sessions.lock().unwrap() = n;
    }
}

#[async_trait]
impl Signaling for FakeSignaling {
    async fn create_session(&self) -> Result<SessionGrant, TransportError> {
        if *self.missing_credential.lock().unwrap() {
            return Err(TransportError::MissingCredential("api_key"));
        }
        {
            let mut fails = self.fail_sessions.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(TransportError::Signaling("backend unavailable".to_string()));
            }
        }
        *self.sessions_created.lock().unwrap() += 1;
        Ok(SessionGrant {
            token: "grant-token".to_string(),
        })
    }

    async fn exchange_offer(
        &self,
        _grant: &SessionGrant,
        _offer_sdp: &str,
    ) -> Result<String, TransportError> {
        Ok("answer-sdp".to_string())
    }
}

// --- assembled client ---

pub struct TestClient {
    pub ctx: SessionContext,
    pub settings: Arc<MemorySettings>,
    pub ui: Arc<RecordingUi>,
    pub noise: Arc<AdjustableNoise>,
    pub capture: Arc<CaptureLoop>,
    pub pipeline: Arc<StreamingPipeline>,
    pub voice_router: Arc<VoiceRouter>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub engine: Arc<FakeEngine>,
    pub engine_tx: EngineEventSender,
    pub tts: Arc<FakeVoice>,
    pub factory: Arc<FakeTransportFactory>,
    pub signaling: Arc<FakeSignaling>,
    pub restart_rx: mpsc::Receiver<RestartReason>,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl TestClient {
    /// Drain everything currently in the event stream.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn inject(&self, event: TransportEvent) {
        self.factory
            .latest_events()
            .send(event)
            .await
            .expect("event pump alive");
    }

    pub async fn engine_event(&self, event: EngineEvent) {
        self.engine_tx.send(event).await.expect("engine pump alive");
    }

    /// Let spawned tasks and timers make progress under paused time.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn build_client() -> TestClient {
    build_client_with(Tuning::default())
}

pub fn build_client_with(tuning: Tuning) -> TestClient {
    let settings = Arc::new(MemorySettings::new());
    // Tests run against the fake hosted voice by default.
    settings.set("tts_provider", "hosted");
    let ui = Arc::new(RecordingUi::default());
    let noise = Arc::new(AdjustableNoise::new(0.0));

    let ctx = SessionContext::new(
        Arc::clone(&ui) as Arc<dyn UiSink>,
        Arc::clone(&settings) as Arc<dyn Settings>,
        tuning,
        Arc::clone(&noise) as Arc<dyn NoiseEstimate>,
    );

    let (utterance_tx, utterance_rx) = mpsc::channel(16);
    let (restart_tx, restart_rx) = mpsc::channel(4);

    let capture = CaptureLoop::new(ctx.clone(), utterance_tx, restart_tx.clone());
    let speaking: Arc<dyn SpeakingSink> = capture.clone();

    let tts = Arc::new(FakeVoice::new());
    let voice_router = VoiceRouter::with_providers(
        ctx.clone(),
        Arc::clone(&speaking),
        Arc::clone(&tts) as Arc<dyn TtsVoice>,
        Arc::clone(&tts) as Arc<dyn TtsVoice>,
        Arc::clone(&tts) as Arc<dyn TtsVoice>,
        Arc::clone(&tts) as Arc<dyn TtsVoice>,
    );
    let pipeline = StreamingPipeline::new(ctx.clone(), Arc::clone(&voice_router), speaking);
    capture.set_playback(pipeline.clone());

    let (engine_tx, engine_rx) = engine_channel();
    let engine = Arc::new(FakeEngine::new(engine_tx.clone(), true));
    capture.attach_engine(Arc::clone(&engine) as Arc<dyn SpeechEngine>, engine_rx);

    let signaling = Arc::new(FakeSignaling::new());
    let factory = Arc::new(FakeTransportFactory::default());
    let supervisor = ConnectionSupervisor::new(
        ctx.clone(),
        Arc::clone(&capture),
        Arc::clone(&pipeline),
        Arc::clone(&voice_router),
        Arc::clone(&signaling) as Arc<dyn Signaling>,
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        restart_tx,
    );
    supervisor.spawn_utterance_pump(utterance_rx);

    let events = ctx.bus.subscribe();

    TestClient {
        ctx,
        settings,
        ui,
        noise,
        capture,
        pipeline,
        voice_router,
        supervisor,
        engine,
        engine_tx,
        tts,
        factory,
        signaling,
        restart_rx,
        events,
    }
}
