mod common;

use std::time::Duration;

use common::{build_client, build_client_with};
use vigil::connection::transport::TransportEvent;
use vigil::{RestartReason, SessionEvent, SessionFlag, SessionPhase, Tuning};

fn scheduled_delays(events: &[SessionEvent]) -> Vec<(u32, Duration)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ReconnectScheduled { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_success_then_counter_resets() {
    let mut client = build_client();
    client.signaling.fail_next(3);

    client.supervisor.connect().await;
    // Delays 2s, 4s, 8s then a successful fourth attempt.
    tokio::time::sleep(Duration::from_secs(30)).await;

    let events = client.drain_events();
    let delays = scheduled_delays(&events);
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_secs(2)),
            (2, Duration::from_secs(4)),
            (3, Duration::from_secs(8)),
        ]
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::ConnectionEstablished { .. })),
        "fourth attempt connects"
    );
    assert!(client.supervisor.is_connected());

    // A fresh drop starts over from the base delay: the counter reset to
    // zero on the confirmed connection.
    client
        .inject(TransportEvent::ChannelClosed {
            reason: "remote closed".to_string(),
        })
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let events = client.drain_events();
    let delays = scheduled_delays(&events);
    assert_eq!(delays.first(), Some(&(1, Duration::from_secs(2))));
}

#[tokio::test(start_paused = true)]
async fn at_most_one_reconnect_is_pending() {
    let mut client = build_client();
    client.ctx.session.force(SessionPhase::Connected, "test setup");
    client.ctx.session.set_flag(SessionFlag::WantsConnected, true);
    client.drain_events();

    client.supervisor.schedule_reconnect();
    client.supervisor.schedule_reconnect();
    client.supervisor.schedule_reconnect();
    client.settle().await;

    let events = client.drain_events();
    assert_eq!(
        scheduled_delays(&events).len(),
        1,
        "duplicate schedules collapse into one pending retry"
    );
    assert_eq!(client.ctx.session.phase(), SessionPhase::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn exhausted_ceiling_escalates_to_client_restart() {
    let tuning = Tuning {
        max_reconnect_attempts: 2,
        ..Tuning::default()
    };
    let mut client = build_client_with(tuning);
    client.signaling.fail_next(100);

    client.supervisor.connect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let events = client.drain_events();
    assert_eq!(scheduled_delays(&events).len(), 2, "two attempts, then stop");
    assert!(
        events.iter().any(|e| matches!(
            e,
            SessionEvent::Fatal {
                source: "connection",
                ..
            }
        )),
        "ceiling emits a fatal event"
    );
    assert_eq!(
        client.restart_rx.try_recv().ok(),
        Some(RestartReason::ReconnectExhausted),
        "full client restart is the last resort"
    );

    // No further automatic retries after the ceiling.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(scheduled_delays(&client.drain_events()).is_empty());

    // A fresh connect() starts the cycle over.
    client.signaling.fail_next(0);
    client.supervisor.connect().await;
    client.settle().await;
    assert!(client
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionEstablished { .. })));
}

#[tokio::test(start_paused = true)]
async fn liveness_watchdog_catches_a_silently_dead_transport() {
    let mut client = build_client();
    client.supervisor.connect().await;
    client.settle().await;
    client.drain_events();

    // The state machine still says Connected; the transport is dead.
    client.factory.latest_transport().set_open(false);
    assert_eq!(client.ctx.session.phase(), SessionPhase::Connected);
    assert!(!client.supervisor.is_connected());

    tokio::time::sleep(Duration::from_secs(6)).await;
    let events = client.drain_events();
    assert!(
        !scheduled_delays(&events).is_empty(),
        "monitor noticed the divergence and scheduled a reconnect"
    );
}

#[tokio::test(start_paused = true)]
async fn negotiation_failure_and_liveness_failure_share_the_reconnect_path() {
    let mut client = build_client();
    client.signaling.fail_next(1);
    client.supervisor.connect().await;
    client.settle().await;

    let events = client.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionFailed { .. })));
    assert_eq!(scheduled_delays(&events).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_credential_is_surfaced_once_with_no_retry() {
    let mut client = build_client();
    *client.signaling.missing_credential.lock().unwrap() = true;

    client.supervisor.connect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let events = client.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ConnectionFailed { .. })));
    assert!(
        scheduled_delays(&events).is_empty(),
        "configuration errors are not retried"
    );
    assert_eq!(client.ctx.session.phase(), SessionPhase::Idle);
    assert!(!client.ctx.session.flag(SessionFlag::WantsConnected));
}

#[tokio::test(start_paused = true)]
async fn hangup_cancels_a_pending_reconnect() {
    let mut client = build_client();
    client.signaling.fail_next(100);
    client.supervisor.connect().await;
    client.settle().await;
    assert_eq!(scheduled_delays(&client.drain_events()).len(), 1);

    client.supervisor.hangup().await;
    assert_eq!(client.ctx.session.phase(), SessionPhase::Idle);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let events = client.drain_events();
    assert!(
        scheduled_delays(&events).is_empty(),
        "no retries after an intentional disconnect"
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Disconnected)));
}
