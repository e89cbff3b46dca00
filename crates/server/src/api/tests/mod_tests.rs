use std::{sync::Arc, time::Duration};

use super::*;
use ledger_client::{DevLedger, DevLedgerConfig};
use relay::RelayConfig;
use shared::domain::{DeviceKey, DeviceState, RequestedState, Topology};
use storage::LedgerStore;

async fn setup() -> (ApiContext, Arc<DevLedger>) {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    let mut config = DevLedgerConfig::new("api-tests");
    config.block_time = Duration::from_millis(10);
    config.poll_interval = Duration::from_millis(5);
    let ledger = Arc::new(DevLedger::new(store, config));
    ledger
        .provision(&Topology::default())
        .await
        .expect("provision");
    ledger.spawn_block_producer();

    let relay = RelayService::start(RelayConfig::default(), ledger.clone());
    let reconciler = Reconciler::new(relay.clone(), Duration::from_secs(60));
    (ApiContext { relay, reconciler }, ledger)
}

#[test]
fn parses_canonical_request() {
    let request = parse_relay_request(
        br#"{"deviceClass":"heater","deviceId":2,"desiredState":{"on":true,"level":45}}"#,
    )
    .expect("request");
    assert_eq!(request.device(), DeviceKey::new(DeviceClass::Heater, 2));
    assert_eq!(
        request.desired_state,
        RequestedState {
            on: true,
            level: Some(45)
        }
    );
}

#[test]
fn unknown_class_is_an_unknown_device() {
    let err = parse_relay_request(br#"{"type":"fan","id":1,"desiredState":{"on":true}}"#)
        .expect_err("unknown class");
    assert_eq!(err.error, ErrorKind::UnknownDevice);
    assert!(err.detail.contains("fan"));
}

#[test]
fn missing_fields_are_invalid_state() {
    let err = parse_relay_request(br#"{"deviceClass":"light","deviceId":1}"#)
        .expect_err("missing desired state");
    assert_eq!(err.error, ErrorKind::InvalidState);

    let err = parse_relay_request(b"not json").expect_err("garbage");
    assert_eq!(err.error, ErrorKind::InvalidState);
}

#[tokio::test]
async fn relay_intent_returns_success_for_idle_device() {
    let (ctx, _ledger) = setup().await;
    let request = parse_relay_request(
        br#"{"deviceClass":"light","deviceId":3,"desiredState":{"on":false}}"#,
    )
    .expect("request");

    let response = relay_intent(&ctx, request).await.expect("response");
    assert!(matches!(
        response,
        RelayResponse::Success { confirmed_state, .. } if confirmed_state == DeviceState::off()
    ));
}

#[tokio::test]
async fn relay_intent_maps_validation_errors() {
    let (ctx, _ledger) = setup().await;
    let request = parse_relay_request(
        br#"{"deviceClass":"light","deviceId":1,"desiredState":{"on":true,"level":-1}}"#,
    )
    .expect("request");

    let err = relay_intent(&ctx, request).await.expect_err("invalid");
    assert_eq!(err.error, ErrorKind::InvalidState);
}

#[tokio::test]
async fn device_states_lists_every_device() {
    let (ctx, _ledger) = setup().await;
    let states = device_states(&ctx, true).await;
    assert_eq!(states.devices.len(), 8);
    assert!(states
        .devices
        .iter()
        .all(|device| device.confirmed_state.is_none()));
}
