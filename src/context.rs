use std::sync::Arc;

use crate::capture::endpoint::NoiseEstimate;
use crate::config::{Settings, Tuning};
use crate::events::EventBus;
use crate::session::SharedSession;
use crate::ui::UiSink;
use crate::watchdog::WatchdogRegistry;

/// Everything the components share, constructed once and passed by
/// reference. There is no global mutable state anywhere in the crate.
#[derive(Clone)]
pub struct SessionContext {
    pub session: Arc<SharedSession>,
    pub bus: EventBus,
    pub ui: Arc<dyn UiSink>,
    pub settings: Arc<dyn Settings>,
    pub tuning: Tuning,
    pub watchdogs: Arc<WatchdogRegistry>,
    pub noise: Arc<dyn NoiseEstimate>,
}

impl SessionContext {
    pub fn new(
        ui: Arc<dyn UiSink>,
        settings: Arc<dyn Settings>,
        tuning: Tuning,
        noise: Arc<dyn NoiseEstimate>,
    ) -> Self {
        let bus = EventBus::default();
        let session = Arc::new(SharedSession::new(bus.clone(), Arc::clone(&ui)));
        let watchdogs = Arc::new(WatchdogRegistry::new(Arc::clone(&ui), tuning.clone()));
        Self {
            session,
            bus,
            ui,
            settings,
            tuning,
            watchdogs,
            noise,
        }
    }
}
