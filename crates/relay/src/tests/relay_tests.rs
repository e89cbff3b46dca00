use std::time::Duration;

use ledger_client::LedgerClient;
use shared::{
    domain::{DeviceState, RequestedState},
    error::{ErrorKind, RelayError},
    protocol::{DevicePhase, RelayEvent},
};

use crate::{
    support::{
        door, heater, light, next_event, on, start, wait_for_snapshot, ScriptedLedger,
    },
    Reconciler, RelayOutcome,
};

fn confirmed_state(outcome: RelayOutcome) -> DeviceState {
    match outcome {
        RelayOutcome::Success {
            confirmed_state, ..
        } => confirmed_state,
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn intent_while_awaiting_confirmation_is_queued_then_applied() {
    let ledger = ScriptedLedger::new();
    ledger.hold(light(1));
    let relay = start(&ledger);
    let mut events = relay.subscribe();

    let first = tokio::spawn({
        let relay = relay.clone();
        async move { relay.relay(light(1), on(60).into()).await }
    });
    ledger.wait_for_submissions(1).await;

    let queued = relay
        .relay(light(1), on(80).into())
        .await
        .expect("queued");
    assert_eq!(
        queued,
        RelayOutcome::Queued {
            queued_state: on(80)
        }
    );

    let busy = wait_for_snapshot(&relay, light(1), |snapshot| {
        snapshot.queued.is_some() && snapshot.phase() == DevicePhase::AwaitingConfirmation
    })
    .await;
    assert_eq!(busy.visible_state(), Some(on(80)));
    assert_eq!(busy.confirmed, None);

    ledger.confirm_next();
    let first = first.await.expect("join").expect("first intent");
    assert_eq!(confirmed_state(first), on(60));

    ledger.wait_for_submissions(2).await;
    ledger.confirm_next();
    next_event(&mut events, |event| {
        matches!(
            event,
            RelayEvent::CommandConfirmed { confirmed_state, .. } if *confirmed_state == on(80)
        )
    })
    .await;

    let settled = wait_for_snapshot(&relay, light(1), |snapshot| {
        snapshot.phase() == DevicePhase::Idle && snapshot.confirmed == Some(on(80))
    })
    .await;
    assert_eq!(settled.queued, None);
    assert_eq!(settled.visible_state(), Some(on(80)));
    assert_eq!(ledger.states_sent(light(1)), vec![on(60), on(80)]);
}

#[tokio::test]
async fn latest_of_many_queued_intents_wins() {
    let ledger = ScriptedLedger::new();
    ledger.hold(light(3));
    let relay = start(&ledger);
    let mut events = relay.subscribe();

    let first = tokio::spawn({
        let relay = relay.clone();
        async move { relay.relay(light(3), on(10).into()).await }
    });
    ledger.wait_for_submissions(1).await;

    for level in [20, 30, 40, 50] {
        let outcome = relay
            .relay(light(3), on(level).into())
            .await
            .expect("queued");
        assert!(matches!(outcome, RelayOutcome::Queued { .. }));
    }

    ledger.confirm_next();
    first.await.expect("join").expect("first intent");
    ledger.wait_for_submissions(2).await;
    ledger.confirm_next();

    let mut superseded = 0;
    loop {
        match next_event(&mut events, |_| true).await {
            RelayEvent::CommandSuperseded { .. } => superseded += 1,
            RelayEvent::CommandConfirmed {
                confirmed_state, ..
            } if confirmed_state == on(50) => break,
            _ => {}
        }
    }
    assert_eq!(superseded, 3);
    assert_eq!(ledger.states_sent(light(3)), vec![on(10), on(50)]);
}

#[tokio::test]
async fn queued_intent_equal_to_in_flight_state_is_still_submitted() {
    let ledger = ScriptedLedger::new();
    ledger.hold(light(1));
    let relay = start(&ledger);

    let first = tokio::spawn({
        let relay = relay.clone();
        async move { relay.relay(light(1), on(60).into()).await }
    });
    ledger.wait_for_submissions(1).await;
    relay
        .relay(light(1), on(60).into())
        .await
        .expect("queued");

    ledger.confirm_next();
    first.await.expect("join").expect("first intent");
    ledger.wait_for_submissions(2).await;
    ledger.confirm_next();

    wait_for_snapshot(&relay, light(1), |snapshot| {
        snapshot.pending.is_none() && snapshot.attempts == 2
    })
    .await;
    assert_eq!(ledger.states_sent(light(1)), vec![on(60), on(60)]);
}

#[tokio::test(start_paused = true)]
async fn confirmation_timeout_fails_the_caller_and_frees_the_device() {
    let ledger = ScriptedLedger::new();
    let door3 = door(3);
    ledger.write_externally(door3, DeviceState::off());
    ledger.hold(door3);
    let relay = start(&ledger);
    Reconciler::new(relay.clone(), Duration::from_secs(5))
        .reconcile_once()
        .await;

    let err = relay
        .relay(door3, on(100).into())
        .await
        .expect_err("confirmation never arrives");
    assert_eq!(err, RelayError::Timeout(60));
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let snapshot = wait_for_snapshot(&relay, door3, |snapshot| snapshot.pending.is_none()).await;
    assert_eq!(snapshot.confirmed, Some(DeviceState::off()));
    assert_eq!(snapshot.visible_state(), Some(DeviceState::off()));
    assert_eq!(
        snapshot.last_error.as_ref().map(|error| error.error),
        Some(ErrorKind::Timeout)
    );

    ledger.release(door3);
    let outcome = relay
        .relay(door3, on(100).into())
        .await
        .expect("device accepts a new intent");
    assert_eq!(confirmed_state(outcome), on(100));
}

#[tokio::test]
async fn out_of_range_level_is_rejected_before_any_ledger_call() {
    let ledger = ScriptedLedger::new();
    let relay = start(&ledger);

    let err = relay
        .relay(
            heater(2),
            RequestedState {
                on: true,
                level: Some(150),
            },
        )
        .await
        .expect_err("invalid");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(ledger.calls().is_empty());

    let snapshot = relay.snapshot(heater(2)).expect("snapshot");
    assert_eq!(snapshot.desired, None);
    assert_eq!(snapshot.attempts, 0);
}

#[tokio::test]
async fn unknown_device_is_rejected_before_validation() {
    let ledger = ScriptedLedger::new();
    let relay = start(&ledger);

    let err = relay
        .relay(
            light(9),
            RequestedState {
                on: true,
                level: Some(500),
            },
        )
        .await
        .expect_err("unknown");
    assert_eq!(err, RelayError::UnknownDevice("light9".to_string()));
    assert!(ledger.calls().is_empty());
}

#[tokio::test]
async fn submission_rejection_is_reported_and_recorded() {
    let ledger = ScriptedLedger::new();
    ledger.reject(heater(2));
    let relay = start(&ledger);

    let err = relay
        .relay(heater(2), on(30).into())
        .await
        .expect_err("rejected");
    assert!(matches!(err, RelayError::Submission(ref reason) if reason.contains("offline")));

    let snapshot = wait_for_snapshot(&relay, heater(2), |snapshot| {
        snapshot.pending.is_none() && snapshot.last_error.is_some()
    })
    .await;
    assert_eq!(snapshot.phase(), DevicePhase::Idle);
    assert_eq!(snapshot.confirmed, None);
    assert_eq!(
        snapshot.last_error.map(|error| error.error),
        Some(ErrorKind::SubmissionError)
    );
}

#[tokio::test]
async fn reverted_transaction_fails_the_caller_and_queued_intent_proceeds() {
    let ledger = ScriptedLedger::new();
    ledger.hold(light(2));
    let relay = start(&ledger);
    let mut events = relay.subscribe();

    let first = tokio::spawn({
        let relay = relay.clone();
        async move { relay.relay(light(2), on(30).into()).await }
    });
    ledger.wait_for_submissions(1).await;
    relay
        .relay(light(2), on(70).into())
        .await
        .expect("queued");

    ledger.revert_next("device faulted");
    let err = first.await.expect("join").expect_err("reverted");
    assert!(matches!(err, RelayError::Confirmation(ref reason) if reason.contains("faulted")));
    next_event(&mut events, |event| {
        matches!(
            event,
            RelayEvent::CommandFailed { error, .. } if error.error == ErrorKind::ConfirmationError
        )
    })
    .await;

    ledger.wait_for_submissions(2).await;
    ledger.confirm_next();
    let snapshot = wait_for_snapshot(&relay, light(2), |snapshot| {
        snapshot.confirmed == Some(on(70))
    })
    .await;
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_device_has_at_most_one_transaction_in_flight() {
    let ledger = ScriptedLedger::new();
    ledger.set_auto_delay(Duration::from_millis(20));
    let relay = start(&ledger);
    let devices = [light(1), light(2), heater(1), door(1)];

    let mut tasks = Vec::new();
    for round in 0..5u8 {
        for device in devices {
            let relay = relay.clone();
            tasks.push(tokio::spawn(async move {
                relay.relay(device, on(10 + round * 10).into()).await
            }));
        }
    }
    for task in tasks {
        task.await.expect("join").expect("relay");
    }

    for device in devices {
        let snapshot = wait_for_snapshot(&relay, device, |snapshot| {
            snapshot.pending.is_none() && snapshot.queued.is_none()
        })
        .await;
        assert_eq!(snapshot.confirmed, snapshot.desired);
    }
    assert_eq!(ledger.max_active_per_device(), 1);
    assert!(ledger.max_active_total() > 1);
}

#[tokio::test]
async fn busy_device_does_not_block_other_devices() {
    let ledger = ScriptedLedger::new();
    ledger.hold(light(1));
    let relay = start(&ledger);

    let _stuck = tokio::spawn({
        let relay = relay.clone();
        async move { relay.relay(light(1), on(50).into()).await }
    });
    ledger.wait_for_submissions(1).await;

    let outcome = relay
        .relay(door(2), DeviceState::off().into())
        .await
        .expect("door succeeds");
    assert_eq!(confirmed_state(outcome), DeviceState::off());
    let stuck = relay.snapshot(light(1)).expect("snapshot");
    assert!(stuck.pending.is_some());
    assert_eq!(stuck.visible_state(), Some(on(50)));
}

#[tokio::test]
async fn confirmed_state_round_trips_through_ledger_query() {
    let ledger = ScriptedLedger::new();
    let relay = start(&ledger);

    let outcome = relay
        .relay(heater(1), on(40).into())
        .await
        .expect("success");
    let confirmed = confirmed_state(outcome);

    let reading = ledger.query_state(heater(1)).await.expect("reading");
    assert_eq!(reading.state, Some(confirmed));
}

#[tokio::test]
async fn summaries_cover_every_device_in_topology() {
    let ledger = ScriptedLedger::new();
    let relay = start(&ledger);

    let summaries = relay.state_summaries();
    assert_eq!(summaries.len(), 8);
    assert!(summaries
        .iter()
        .all(|summary| summary.phase == DevicePhase::Idle && summary.visible_state.is_none()));
}
