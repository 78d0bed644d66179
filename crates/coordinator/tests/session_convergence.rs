//! Multi-client convergence over a shared in-memory event log
//!
//! Each session is a full coordinator instance; only the event log is
//! shared. Control channels never open (no real ICE connectivity in tests),
//! so convergence here exercises the event-log mirror path.

use meshcall_coordinator::{
    CallSession, CoordinatorConfig, EventLog, InMemoryEventLog, Role, SessionOptions,
};
use std::sync::Arc;
use std::time::Duration;

const ROOM: &str = "!room:example.org";
const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn options(user_id: &str, role: Role) -> SessionOptions {
    SessionOptions {
        session_id: ROOM.to_string(),
        user_id: user_id.to_string(),
        display_name: user_id.to_string(),
        avatar_url: None,
        role,
        config: CoordinatorConfig {
            // Keep the deferred path fast in tests
            sync_debounce_ms: 50,
            ..Default::default()
        },
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

async fn pair(log: &Arc<InMemoryEventLog>) -> (Arc<CallSession>, Arc<CallSession>) {
    init_tracing();
    let alice = CallSession::create(
        Arc::clone(log) as Arc<dyn EventLog>,
        options(ALICE, Role::Host),
    )
    .await
    .unwrap();
    let bob = CallSession::create(
        Arc::clone(log) as Arc<dyn EventLog>,
        options(BOB, Role::Listener),
    )
    .await
    .unwrap();
    settle().await;
    (alice, bob)
}

#[tokio::test]
async fn two_sessions_discover_each_other() {
    let log = InMemoryEventLog::new();
    let (alice, bob) = pair(&log).await;

    let seen_by_alice = alice.participants().await;
    assert_eq!(seen_by_alice.len(), 2);
    assert!(seen_by_alice.iter().any(|p| p.user_id == BOB && !p.is_local));

    let seen_by_bob = bob.participants().await;
    assert_eq!(seen_by_bob.len(), 2);
    assert!(seen_by_bob.iter().any(|p| p.user_id == ALICE && !p.is_local));

    // Roles survived the join exchange
    assert_eq!(
        seen_by_bob.iter().find(|p| p.user_id == ALICE).unwrap().role,
        Role::Host
    );

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn hand_raise_then_stage_invite_converges() {
    let log = InMemoryEventLog::new();
    let (alice, bob) = pair(&log).await;

    bob.raise_hand().await.unwrap();
    settle().await;

    let stage = alice.stage().await;
    assert_eq!(stage.hand_raise_queue, vec![BOB.to_string()]);

    alice
        .bring_participant_to_stage(BOB, None)
        .await
        .unwrap();
    settle().await;

    for session in [&alice, &bob] {
        let stage = session.stage().await;
        assert!(stage.hand_raise_queue.is_empty());
        assert!(stage.speakers.contains(&BOB.to_string()));
        let bob_entry = session
            .participants()
            .await
            .into_iter()
            .find(|p| p.user_id == BOB)
            .unwrap();
        assert_eq!(bob_entry.role, Role::Participant);
        assert!(bob_entry.hand_raised_at.is_none());
    }

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn demotion_returns_to_listener_everywhere() {
    let log = InMemoryEventLog::new();
    let (alice, bob) = pair(&log).await;

    bob.raise_hand().await.unwrap();
    settle().await;
    alice.bring_participant_to_stage(BOB, None).await.unwrap();
    settle().await;
    alice.move_participant_to_audience(BOB).await.unwrap();
    settle().await;

    for session in [&alice, &bob] {
        let bob_entry = session
            .participants()
            .await
            .into_iter()
            .find(|p| p.user_id == BOB)
            .unwrap();
        assert_eq!(bob_entry.role, Role::Listener);
        assert!(bob_entry.hand_raised_at.is_none());
    }

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn leave_removes_participant_remotely() {
    let log = InMemoryEventLog::new();
    let (alice, bob) = pair(&log).await;

    bob.leave().await;
    settle().await;

    let remaining = alice.participants().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].user_id, ALICE);

    alice.leave().await;
}

#[tokio::test]
async fn co_watch_state_converges() {
    let log = InMemoryEventLog::new();
    let (alice, bob) = pair(&log).await;

    alice
        .toggle_co_watch(Some("https://example.org/stream".to_string()))
        .await
        .unwrap();
    settle().await;

    let seen = bob.metadata().await.co_watch.unwrap();
    assert!(seen.active);
    assert_eq!(seen.started_by, ALICE);
    assert_eq!(seen.url.as_deref(), Some("https://example.org/stream"));

    // A later stop from bob wins over alice's earlier start
    bob.toggle_co_watch(None).await.unwrap();
    settle().await;
    assert!(!alice.metadata().await.co_watch.unwrap().active);

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn remote_snapshot_cannot_downgrade_host() {
    let log = InMemoryEventLog::new();
    let (alice, bob) = pair(&log).await;

    // Bob's published snapshots carry alice as host; nothing bob does may
    // demote her on her own client
    bob.raise_hand().await.unwrap();
    bob.lower_hand(None).await.unwrap();
    settle().await;

    let alice_entry = alice
        .participants()
        .await
        .into_iter()
        .find(|p| p.user_id == ALICE)
        .unwrap();
    assert_eq!(alice_entry.role, Role::Host);
    assert!(alice_entry.is_local);

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn sessions_in_different_rooms_are_isolated() {
    let log = InMemoryEventLog::new();

    let alice = CallSession::create(
        Arc::clone(&log) as Arc<dyn EventLog>,
        options(ALICE, Role::Host),
    )
    .await
    .unwrap();
    let mut other = options(BOB, Role::Host);
    other.session_id = "!elsewhere:example.org".to_string();
    let bob = CallSession::create(Arc::clone(&log) as Arc<dyn EventLog>, other)
        .await
        .unwrap();
    settle().await;

    assert_eq!(alice.participants().await.len(), 1);
    assert_eq!(bob.participants().await.len(), 1);

    alice.leave().await;
    bob.leave().await;
}
