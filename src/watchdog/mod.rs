//! Named periodic supervisors. Every component self-heals through these:
//! a watchdog ticks on an interval, optionally auto-aborts after a max
//! duration, and can always be replaced or stopped by name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Tuning;
use crate::session::{SessionFlag, SharedSession};
use crate::ui::UiSink;

/// Well-known watchdog names.
pub mod names {
    pub const CAPTURE_RESTART: &str = "capture-restart";
    pub const CAPTURE_HEALTH: &str = "capture-health";
    pub const CONNECTION_MONITOR: &str = "connection-monitor";
    pub const SPEAKING_TIMEOUT: &str = "speaking-timeout";
}

pub struct WatchdogOptions {
    /// Auto-abort: once this much time has elapsed since start (or the last
    /// `reset`), the watchdog stops itself and fires `on_timeout` once.
    pub max_duration: Option<Duration>,
    pub on_timeout: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            max_duration: None,
            on_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogStatus {
    pub name: String,
    pub interval: Duration,
    pub elapsed: Duration,
    pub max_duration: Option<Duration>,
}

struct Entry {
    cancel: CancellationToken,
    started: Arc<Mutex<Instant>>,
    interval: Duration,
    max_duration: Option<Duration>,
}

pub struct WatchdogRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    ui: Arc<dyn UiSink>,
    tuning: Tuning,
}

impl WatchdogRegistry {
    pub fn new(ui: Arc<dyn UiSink>, tuning: Tuning) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ui,
            tuning,
        }
    }

    /// Install a periodic supervisor under `name`, replacing any existing
    /// entry atomically; there are never two timers under one name. Tick
    /// failures are logged, never propagated; a failing callback does not
    /// kill its watchdog.
    pub fn start<F>(&self, name: &str, interval: Duration, options: WatchdogOptions, tick: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let started = Arc::new(Mutex::new(Instant::now()));

        {
            let mut entries = self.entries.lock().expect("watchdog lock");
            if let Some(old) = entries.insert(
                name.to_string(),
                Entry {
                    cancel: cancel.clone(),
                    started: Arc::clone(&started),
                    interval,
                    max_duration: options.max_duration,
                },
            ) {
                old.cancel.cancel();
            }
        }

        self.ui.log(&format!(
            "[watchdog] started: {name} (interval: {}ms)",
            interval.as_millis()
        ));

        let entries = Arc::clone(&self.entries);
        let ui = Arc::clone(&self.ui);
        let task_name = name.to_string();
        let max_duration = options.max_duration;
        let mut on_timeout = options.on_timeout;

        tokio::spawn(async move {
            // First tick after one full interval, matching timer semantics
            // the rest of the session is written against.
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(max) = max_duration {
                            let elapsed = started.lock().expect("watchdog lock").elapsed();
                            if elapsed > max {
                                ui.log(&format!(
                                    "[watchdog] {task_name} exceeded max duration ({}ms)",
                                    elapsed.as_millis()
                                ));
                                // Remove our own entry unless it was already
                                // replaced by a newer incarnation.
                                let mut map = entries.lock().expect("watchdog lock");
                                if map
                                    .get(&task_name)
                                    .is_some_and(|e| Arc::ptr_eq(&e.started, &started))
                                {
                                    map.remove(&task_name);
                                }
                                drop(map);
                                if let Some(cb) = on_timeout.take() {
                                    cb();
                                }
                                break;
                            }
                        }
                        if let Err(e) = tick() {
                            ui.log(&format!("[watchdog] {task_name} error: {e}"));
                        }
                    }
                }
            }
        });
    }

    /// Idempotent.
    pub fn stop(&self, name: &str) {
        let removed = self
            .entries
            .lock()
            .expect("watchdog lock")
            .remove(name);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            self.ui.log(&format!("[watchdog] stopped: {name}"));
        }
    }

    pub fn stop_all(&self) {
        let names: Vec<String> = self
            .entries
            .lock()
            .expect("watchdog lock")
            .keys()
            .cloned()
            .collect();
        for name in names {
            self.stop(&name);
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.entries
            .lock()
            .expect("watchdog lock")
            .contains_key(name)
    }

    /// Rebase the start time, extending a max-duration window without
    /// restarting the whole entry.
    pub fn reset(&self, name: &str) {
        let rebased = {
            let entries = self.entries.lock().expect("watchdog lock");
            match entries.get(name) {
                Some(entry) => {
                    *entry.started.lock().expect("watchdog lock") = Instant::now();
                    true
                }
                None => false,
            }
        };
        if rebased {
            self.ui.log(&format!("[watchdog] reset: {name}"));
        }
    }

    pub fn status(&self) -> Vec<WatchdogStatus> {
        let entries = self.entries.lock().expect("watchdog lock");
        entries
            .iter()
            .map(|(name, entry)| WatchdogStatus {
                name: name.clone(),
                interval: entry.interval,
                elapsed: entry.started.lock().expect("watchdog lock").elapsed(),
                max_duration: entry.max_duration,
            })
            .collect()
    }

    // --- convenience constructors for the session's standard supervisors ---

    /// Restart capture whenever it should be active but is not.
    pub fn start_capture_watchdog<F>(&self, session: Arc<SharedSession>, on_restart: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let ui = Arc::clone(&self.ui);
        self.start(
            names::CAPTURE_RESTART,
            self.tuning.capture_watchdog_interval,
            WatchdogOptions::default(),
            move || {
                if session.flag(SessionFlag::WantsListening)
                    && !session.flag(SessionFlag::AssistantSpeaking)
                    && !session.flag(SessionFlag::CaptureActive)
                {
                    ui.log("[watchdog] capture stopped, triggering restart");
                    on_restart();
                }
                Ok(())
            },
        );
    }

    /// Periodic stuck-state probe while capture is wanted.
    pub fn start_capture_health<F>(&self, session: Arc<SharedSession>, on_check: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start(
            names::CAPTURE_HEALTH,
            self.tuning.capture_health_interval,
            WatchdogOptions::default(),
            move || {
                if session.flag(SessionFlag::WantsListening)
                    && !session.flag(SessionFlag::AssistantSpeaking)
                {
                    on_check();
                }
                Ok(())
            },
        );
    }

    /// Compare *actual* transport liveness against the wants-connected flag.
    /// The state machine can believe it is connected while the transport is
    /// dead; this watchdog is what notices.
    pub fn start_connection_monitor<L, F>(&self, session: Arc<SharedSession>, is_live: L, on_dead: F)
    where
        L: Fn() -> bool + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let ui = Arc::clone(&self.ui);
        self.start(
            names::CONNECTION_MONITOR,
            self.tuning.connection_monitor_interval,
            WatchdogOptions::default(),
            move || {
                if session.flag(SessionFlag::WantsConnected) && !is_live() {
                    ui.log("[watchdog] connection lost (actual check), triggering reconnect");
                    on_dead();
                }
                Ok(())
            },
        );
    }

    /// Hard ceiling on one spoken reply; `on_timeout` must force playback
    /// state clear so the assistant-speaking flag cannot stick.
    pub fn start_speaking_timeout<F>(&self, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.start(
            names::SPEAKING_TIMEOUT,
            Duration::from_secs(1),
            WatchdogOptions {
                max_duration: Some(self.tuning.max_speaking_duration),
                on_timeout: Some(Box::new(on_timeout)),
            },
            || Ok(()),
        );
    }
}
