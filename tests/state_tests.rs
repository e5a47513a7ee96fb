mod common;

use common::build_client;
use vigil::{SessionEvent, SessionFlag, SessionPhase};

const ALL_PHASES: [SessionPhase; 8] = [
    SessionPhase::Idle,
    SessionPhase::Connecting,
    SessionPhase::Connected,
    SessionPhase::Listening,
    SessionPhase::Processing,
    SessionPhase::Speaking,
    SessionPhase::Reconnecting,
    SessionPhase::Error,
];

#[tokio::test]
async fn checked_transitions_follow_the_table() {
    let mut client = build_client();
    let session = client.ctx.session.clone();

    for from in ALL_PHASES {
        for to in ALL_PHASES {
            session.force(from, "test setup");
            client.drain_events();

            let ok = session.transition(to, "probe");
            let expected = from == to || from.allowed_successors().contains(&to);
            assert_eq!(ok, expected, "transition {from} -> {to}");

            let events = client.drain_events();
            if ok && from != to {
                assert_eq!(session.phase(), to);
                assert_eq!(session.previous_phase(), Some(from));
                assert!(
                    matches!(
                        events.as_slice(),
                        [SessionEvent::StateChanged { forced: false, .. }]
                    ),
                    "accepted transition publishes one unforced event"
                );
            } else if !ok {
                assert_eq!(session.phase(), from, "rejected transition is a no-op");
                assert!(
                    events.is_empty(),
                    "rejected transition publishes nothing, got {events:?}"
                );
            } else {
                // Same-state no-op success: nothing published.
                assert!(events.is_empty());
            }
        }
    }
}

#[tokio::test]
async fn forced_transitions_always_succeed_and_are_tagged() {
    let mut client = build_client();
    let session = client.ctx.session.clone();

    for from in ALL_PHASES {
        session.force(from, "test setup");
        client.drain_events();

        // Idle -> Speaking is not in the table from most phases.
        session.force(SessionPhase::Speaking, "recovery");
        assert_eq!(session.phase(), SessionPhase::Speaking);
        assert_eq!(session.previous_phase(), Some(from));

        let events = client.drain_events();
        assert!(
            matches!(
                events.as_slice(),
                [SessionEvent::StateChanged { forced: true, .. }]
            ),
            "forced transition from {from} publishes a forced event"
        );
    }
}

#[tokio::test]
async fn flags_log_only_on_change() {
    let client = build_client();
    let session = client.ctx.session.clone();

    session.set_flag(SessionFlag::WantsConnected, true);
    session.set_flag(SessionFlag::WantsConnected, true);
    session.set_flag(SessionFlag::WantsConnected, true);

    let flag_lines = client
        .ui
        .logs
        .lock()
        .unwrap()
        .iter()
        .filter(|l| l.contains("flag wants-connected"))
        .count();
    assert_eq!(flag_lines, 1, "redundant sets are silent");
    assert!(session.flag(SessionFlag::WantsConnected));
}

#[tokio::test]
async fn predicates_combine_phase_and_flags() {
    let client = build_client();
    let session = client.ctx.session.clone();

    session.force(SessionPhase::Listening, "test setup");
    assert!(session.is_connectedish());
    assert!(session.can_listen());
    assert!(session.can_send_message());

    session.set_flag(SessionFlag::AssistantSpeaking, true);
    assert!(session.is_connectedish());
    assert!(!session.can_listen());
    assert!(!session.can_send_message());

    session.set_flag(SessionFlag::AssistantSpeaking, false);
    session.force(SessionPhase::Idle, "test setup");
    assert!(!session.is_connectedish());
    assert!(!session.can_send_message());
}
