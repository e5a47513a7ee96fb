mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::build_client;
use vigil::watchdog::WatchdogOptions;

#[tokio::test(start_paused = true)]
async fn restart_under_same_name_replaces_the_timer() {
    let client = build_client();
    let watchdogs = &client.ctx.watchdogs;

    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));

    {
        let first = Arc::clone(&first);
        watchdogs.start(
            "probe",
            Duration::from_millis(100),
            WatchdogOptions::default(),
            move || {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
    }
    {
        let second = Arc::clone(&second);
        watchdogs.start(
            "probe",
            Duration::from_millis(100),
            WatchdogOptions::default(),
            move || {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
    }

    tokio::time::sleep(Duration::from_millis(1050)).await;

    assert_eq!(
        first.load(Ordering::SeqCst),
        0,
        "replaced watchdog never ticks"
    );
    let ticks = second.load(Ordering::SeqCst);
    assert!(
        (9..=11).contains(&ticks),
        "single timer under the name, got {ticks} ticks"
    );

    watchdogs.stop("probe");
    assert!(!watchdogs.is_running("probe"));
    // Idempotent.
    watchdogs.stop("probe");
}

#[tokio::test(start_paused = true)]
async fn max_duration_fires_timeout_once_and_stops() {
    let client = build_client();
    let watchdogs = &client.ctx.watchdogs;

    let ticks = Arc::new(AtomicU32::new(0));
    let timeouts = Arc::new(AtomicU32::new(0));

    {
        let ticks = Arc::clone(&ticks);
        let timeouts = Arc::clone(&timeouts);
        watchdogs.start(
            "bounded",
            Duration::from_millis(50),
            WatchdogOptions {
                max_duration: Some(Duration::from_millis(200)),
                on_timeout: Some(Box::new(move || {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                })),
            },
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(timeouts.load(Ordering::SeqCst), 1, "timeout fires exactly once");
    assert!(!watchdogs.is_running("bounded"), "auto-stopped after timeout");
    let ticked = ticks.load(Ordering::SeqCst);
    assert!(ticked <= 4, "no ticks after the window, got {ticked}");
}

#[tokio::test(start_paused = true)]
async fn reset_extends_a_max_duration_window() {
    let client = build_client();
    let watchdogs = &client.ctx.watchdogs;

    let timeouts = Arc::new(AtomicU32::new(0));
    {
        let timeouts = Arc::clone(&timeouts);
        watchdogs.start(
            "extendable",
            Duration::from_millis(100),
            WatchdogOptions {
                max_duration: Some(Duration::from_millis(300)),
                on_timeout: Some(Box::new(move || {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                })),
            },
            || Ok(()),
        );
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    watchdogs.reset("extendable");
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(
        timeouts.load(Ordering::SeqCst),
        0,
        "reset rebased the window"
    );
    assert!(watchdogs.is_running("extendable"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1, "expires after the extension");
}

#[tokio::test(start_paused = true)]
async fn tick_failures_do_not_kill_the_watchdog() {
    let client = build_client();
    let watchdogs = &client.ctx.watchdogs;

    let ticks = Arc::new(AtomicU32::new(0));
    {
        let ticks = Arc::clone(&ticks);
        watchdogs.start(
            "flaky",
            Duration::from_millis(100),
            WatchdogOptions::default(),
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("callback blew up")
            },
        );
    }

    tokio::time::sleep(Duration::from_millis(550)).await;
    assert!(ticks.load(Ordering::SeqCst) >= 4, "kept ticking after failures");
    assert!(watchdogs.is_running("flaky"));
    assert!(client.ui.log_contains("flaky error"));
}

#[tokio::test(start_paused = true)]
async fn status_reports_live_entries() {
    let client = build_client();
    let watchdogs = &client.ctx.watchdogs;

    watchdogs.start(
        "visible",
        Duration::from_millis(100),
        WatchdogOptions::default(),
        || Ok(()),
    );
    tokio::time::sleep(Duration::from_millis(350)).await;

    let status = watchdogs.status();
    let entry = status
        .iter()
        .find(|s| s.name == "visible")
        .expect("entry listed");
    assert_eq!(entry.interval, Duration::from_millis(100));
    assert!(entry.elapsed >= Duration::from_millis(300));

    watchdogs.stop_all();
    assert!(watchdogs.status().is_empty());
}
