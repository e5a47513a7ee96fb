use tracing::info;

/// Display treatment for the live transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptState {
    Idle,
    Listening,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Idle,
    Busy,
    Connected,
}

/// Fire-and-forget presentation sink. The core consumes no return values;
/// a broken or absent UI must never stall the session.
pub trait UiSink: Send + Sync {
    fn log(&self, line: &str);
    fn toast(&self, message: &str);
    fn set_transcript(&self, text: &str, state: TranscriptState);
    fn add_exchange(&self, role: &str, text: &str, input_tokens: u64, output_tokens: u64);
    fn set_controls(&self, mode: ControlMode);
}

/// Routes every UI call into the tracing log. The default for headless
/// deployments.
pub struct TracingUi;

impl UiSink for TracingUi {
    fn log(&self, line: &str) {
        info!(target: "vigil::ui", "{line}");
    }

    fn toast(&self, message: &str) {
        info!(target: "vigil::ui", "toast: {message}");
    }

    fn set_transcript(&self, text: &str, state: TranscriptState) {
        info!(target: "vigil::ui", ?state, "transcript: {text}");
    }

    fn add_exchange(&self, role: &str, text: &str, input_tokens: u64, output_tokens: u64) {
        info!(
            target: "vigil::ui",
            "exchange [{role}] ({input_tokens} in / {output_tokens} out): {text}"
        );
    }

    fn set_controls(&self, mode: ControlMode) {
        info!(target: "vigil::ui", "controls: {mode:?}");
    }
}
