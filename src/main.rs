use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use vigil::capture::endpoint::{FixedNoise, NoiseEstimate};
use vigil::capture::engine::{engine_channel, NullEngine};
use vigil::config::{EnvSettings, Settings, Tuning};
use vigil::connection::transport::{HttpSignaling, NoRealtimeTransport};
use vigil::ui::{TracingUi, UiSink};
use vigil::{
    CaptureLoop, ConnectionSupervisor, RestartReason, SessionContext, SpeakingSink,
    StreamingPipeline, VoiceRouter,
};

enum ClientExit {
    Quit,
    Restart(RestartReason),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("vigil client booting");

    // The restart loop is the last-resort recovery path: when a retry
    // ceiling is exhausted the whole client is rebuilt from scratch.
    loop {
        match run_client().await? {
            ClientExit::Quit => break,
            ClientExit::Restart(reason) => {
                tracing::warn!(?reason, "client restart requested, rebuilding session");
            }
        }
    }
    Ok(())
}

async fn run_client() -> anyhow::Result<ClientExit> {
    let settings: Arc<dyn Settings> = Arc::new(EnvSettings);
    let ui: Arc<dyn UiSink> = Arc::new(TracingUi);
    let noise: Arc<dyn NoiseEstimate> = Arc::new(FixedNoise(0.0));
    let ctx = SessionContext::new(ui, settings, Tuning::default(), noise);

    let (utterance_tx, utterance_rx) = mpsc::channel(16);
    let (restart_tx, mut restart_rx) = mpsc::channel(4);

    let capture = CaptureLoop::new(ctx.clone(), utterance_tx, restart_tx.clone());
    let speaking: Arc<dyn SpeakingSink> = capture.clone();
    let voice = VoiceRouter::new(ctx.clone(), Arc::clone(&speaking));
    let pipeline = StreamingPipeline::new(ctx.clone(), Arc::clone(&voice), speaking);
    capture.set_playback(pipeline.clone());

    // External speech engines feed the event channel; headless deployments
    // run with the null engine and text input only.
    let (_engine_tx, engine_rx) = engine_channel();
    capture.attach_engine(Arc::new(NullEngine), engine_rx);

    let signaling = Arc::new(HttpSignaling::new(
        Arc::clone(&ctx.settings),
        ctx.tuning.signaling_timeout,
    ));
    let supervisor = ConnectionSupervisor::new(
        ctx.clone(),
        Arc::clone(&capture),
        pipeline,
        voice,
        signaling,
        Arc::new(NoRealtimeTransport),
        restart_tx,
    );
    supervisor.spawn_utterance_pump(utterance_rx);

    supervisor.connect().await;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            reason = restart_rx.recv() => {
                if let Some(reason) = reason {
                    supervisor.hangup().await;
                    return Ok(ClientExit::Restart(reason));
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    supervisor.hangup().await;
                    return Ok(ClientExit::Quit);
                };
                match line.trim() {
                    "" => {}
                    "/quit" => {
                        supervisor.hangup().await;
                        return Ok(ClientExit::Quit);
                    }
                    "/hangup" => supervisor.hangup().await,
                    "/connect" => supervisor.connect().await,
                    "/listen" => capture.toggle().await,
                    "/status" => {
                        let snapshot = ctx.session.snapshot();
                        tracing::info!(?snapshot, "session status");
                        for status in ctx.watchdogs.status() {
                            tracing::info!(?status, "watchdog");
                        }
                    }
                    text => supervisor.send_text(text).await,
                }
            }
        }
    }
}
