//! Recovery Integration Tests
//!
//! Exercises failure signaling, scheduled reconnection, budget exhaustion
//! and manual recovery across two live orchestrators. Retry delays are
//! shrunk so the tests run in real time.
//!
//! # Running Tests
//!
//! ```bash
//! # Run all recovery tests
//! cargo test --test recovery
//!
//! # Run with output
//! cargo test --test recovery -- --nocapture
//! ```

mod support;

use stagelink::{
    ConnectionPhase, NegotiationDirection, OrchestratorConfig, OrchestratorEvent, ReconnectConfig,
};
use support::{init_logging, wait_for_event, wait_for_phase, SessionPair};

/// Host retries after 50ms; the participant's own controller is pushed out
/// far enough to stay quiet for the whole test.
fn recovery_pair(max_attempts_host: u32) -> SessionPair {
    let host_config = OrchestratorConfig {
        reconnect: ReconnectConfig {
            max_attempts_host,
            max_attempts_participant: 5,
            base_delay_ms: 50,
            max_delay_ms: 1000,
            debounce_ms: 0,
        },
        ..Default::default()
    };
    let participant_config = OrchestratorConfig {
        reconnect: ReconnectConfig {
            max_attempts_host: 3,
            max_attempts_participant: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            debounce_ms: 0,
        },
        ..Default::default()
    };
    SessionPair::new(host_config, participant_config)
}

async fn negotiate(pair: &SessionPair) -> stagelink::ParticipantId {
    pair.start().await;
    pair.participant.join().await.expect("join");
    let id = pair.participant.local_id().clone();
    wait_for_phase(&pair.host, &id, ConnectionPhase::IceNegotiating).await;
    wait_for_phase(&pair.participant, &id, ConnectionPhase::IceNegotiating).await;
    id
}

// ============================================================================
// Scheduled Recovery
// ============================================================================

#[tokio::test]
async fn test_failure_schedules_reconnect_and_reoffers() {
    init_logging();
    let pair = recovery_pair(3);
    let id = negotiate(&pair).await;
    let mut events = pair.host.subscribe_events();

    let machine = pair.host.participant(&id).await.expect("host leg");
    machine.mark_failed("transport lost").await;

    let scheduled = wait_for_event(&mut events, |event| {
        matches!(event, OrchestratorEvent::ReconnectScheduled { .. })
    })
    .await;
    match scheduled {
        OrchestratorEvent::ReconnectScheduled {
            participant_id,
            attempt,
            delay_ms,
        } => {
            assert_eq!(participant_id, id);
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, 50);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // The timer fires and the machine re-enters signaling under a new
    // negotiation generation.
    wait_for_phase(
        &pair.host,
        &id,
        ConnectionPhase::Signaling(NegotiationDirection::Offering),
    )
    .await;
    assert_eq!(machine.generation(), 1);

    pair.shutdown().await;
}

#[tokio::test]
async fn test_restart_offer_recovers_failed_participant() {
    init_logging();
    let pair = recovery_pair(3);
    let id = negotiate(&pair).await;

    // Both ends notice the outage. The participant's controller is
    // configured to wait a minute, so the host drives recovery.
    let participant_leg = pair
        .participant
        .participant(&id)
        .await
        .expect("participant leg");
    participant_leg.mark_failed("transport lost").await;

    let host_leg = pair.host.participant(&id).await.expect("host leg");
    host_leg.mark_failed("transport lost").await;

    // The host's restart offer lands on the failed participant leg, which
    // rebuilds and answers. Both sides renegotiate.
    wait_for_phase(&pair.host, &id, ConnectionPhase::IceNegotiating).await;
    wait_for_phase(&pair.participant, &id, ConnectionPhase::IceNegotiating).await;

    assert_eq!(host_leg.generation(), 1);
    assert_eq!(participant_leg.generation(), 1);

    pair.shutdown().await;
}

// ============================================================================
// Exhaustion and Manual Recovery
// ============================================================================

#[tokio::test]
async fn test_exhaustion_surfaces_and_force_reconnect_clears_it() {
    init_logging();
    let pair = recovery_pair(1);
    let id = negotiate(&pair).await;
    let mut events = pair.host.subscribe_events();

    let machine = pair.host.participant(&id).await.expect("host leg");
    machine.mark_failed("transport lost").await;

    // Attempt 1 runs, then the connection fails again. The budget of one is
    // spent, so recovery latches off.
    wait_for_phase(
        &pair.host,
        &id,
        ConnectionPhase::Signaling(NegotiationDirection::Offering),
    )
    .await;
    machine.mark_failed("still down").await;

    let exhausted = wait_for_event(&mut events, |event| {
        matches!(event, OrchestratorEvent::ReconnectExhausted { .. })
    })
    .await;
    match exhausted {
        OrchestratorEvent::ReconnectExhausted {
            participant_id,
            attempts,
        } => {
            assert_eq!(participant_id, id);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Manual retry bypasses the latch and starts immediately.
    let started = pair.host.force_reconnect(&id).await.expect("force");
    assert!(started);
    assert_eq!(
        machine.phase(),
        ConnectionPhase::Signaling(NegotiationDirection::Offering)
    );

    pair.shutdown().await;
}

#[tokio::test]
async fn test_second_attempt_escalates_delay() {
    init_logging();
    let pair = recovery_pair(2);
    let id = negotiate(&pair).await;
    let mut events = pair.host.subscribe_events();

    // Fail, let attempt 1 start, then fail that attempt: attempt 2 is the
    // last one in the budget.
    let machine = pair.host.participant(&id).await.expect("host leg");
    machine.mark_failed("transport lost").await;
    wait_for_phase(
        &pair.host,
        &id,
        ConnectionPhase::Signaling(NegotiationDirection::Offering),
    )
    .await;
    machine.mark_failed("attempt failed").await;

    let second = wait_for_event(&mut events, |event| {
        matches!(
            event,
            OrchestratorEvent::ReconnectScheduled { attempt: 2, .. }
        )
    })
    .await;
    match second {
        OrchestratorEvent::ReconnectScheduled { delay_ms, .. } => {
            // Linear escalation: attempt 2 waits twice the base delay.
            assert_eq!(delay_ms, 100);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    pair.shutdown().await;
}
