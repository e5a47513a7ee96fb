pub mod capture;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod session;
pub mod ui;
pub mod voice;
pub mod watchdog;

pub use capture::{CaptureLoop, PlaybackHalt, SpeakingSink};
pub use config::{BackendKind, Settings, SpeakingPolicy, Tuning, VoiceProviderKind};
pub use connection::ConnectionSupervisor;
pub use context::SessionContext;
pub use error::RestartReason;
pub use events::{EventBus, SessionEvent};
pub use session::{SessionFlag, SessionPhase, SharedSession};
pub use voice::pipeline::StreamingPipeline;
pub use voice::VoiceRouter;
pub use watchdog::WatchdogRegistry;
