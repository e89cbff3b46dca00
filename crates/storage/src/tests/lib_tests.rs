use super::*;

fn light(id: u32) -> DeviceKey {
    DeviceKey::new(DeviceClass::Light, id)
}

fn on_at(level: u8) -> DeviceState {
    DeviceState::on_at(level).expect("state")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("ledger.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = LedgerStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn registers_devices_idempotently_without_state() {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    store.register_device(light(1)).await.expect("register");
    store.register_device(light(1)).await.expect("register twice");
    store
        .register_device(DeviceKey::new(DeviceClass::Door, 3))
        .await
        .expect("register door");

    let devices = store.list_devices().await.expect("devices");
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|device| device.state.is_none()));
    assert!(devices.iter().all(|device| !device.faulted));
}

#[tokio::test]
async fn appended_transactions_get_increasing_nonces_and_distinct_refs() {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    store.register_device(light(1)).await.expect("register");

    let first = store
        .append_transaction("relayer", light(1), on_at(60))
        .await
        .expect("first");
    let second = store
        .append_transaction("relayer", light(1), on_at(60))
        .await
        .expect("second");

    assert_eq!(first.nonce + 1, second.nonce);
    assert_ne!(first.tx_ref, second.tx_ref);
    assert_eq!(first.status, TransactionStatus::Pending);
    assert_eq!(store.pending_transactions().await.expect("pending").len(), 2);
}

#[tokio::test]
async fn sealing_applies_pending_transactions_in_nonce_order() {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    store.register_device(light(1)).await.expect("register");
    store
        .append_transaction("relayer", light(1), on_at(60))
        .await
        .expect("first");
    let last = store
        .append_transaction("relayer", light(1), on_at(80))
        .await
        .expect("second");

    let sealed = store.seal_block().await.expect("seal").expect("block");
    assert_eq!(sealed.ordinal, 1);
    assert_eq!(sealed.confirmed.len(), 2);
    assert!(sealed.reverted.is_empty());

    let device = store.device(light(1)).await.expect("device").expect("exists");
    assert_eq!(device.state, Some(on_at(80)));
    assert_eq!(device.updated_block, 1);

    let stored = store
        .transaction(&last.tx_ref)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(stored.status, TransactionStatus::Confirmed);
    assert_eq!(stored.block_ordinal, Some(1));
    assert_eq!(store.head_block().await.expect("head"), 1);
}

#[tokio::test]
async fn sealing_without_pending_transactions_produces_no_block() {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    assert!(store.seal_block().await.expect("seal").is_none());
    assert_eq!(store.head_block().await.expect("head"), 0);
}

#[tokio::test]
async fn faulted_and_unregistered_devices_revert_without_changing_state() {
    let store = LedgerStore::new("sqlite::memory:").await.expect("db");
    store.register_device(light(1)).await.expect("register");
    assert!(store.set_faulted(light(1), true).await.expect("fault"));
    assert!(!store.set_faulted(light(9), true).await.expect("missing"));

    let faulted = store
        .append_transaction("relayer", light(1), on_at(50))
        .await
        .expect("faulted tx");
    let unregistered = store
        .append_transaction("relayer", light(9), on_at(50))
        .await
        .expect("unregistered tx");

    let sealed = store.seal_block().await.expect("seal").expect("block");
    assert_eq!(sealed.reverted.len(), 2);

    let faulted = store
        .transaction(&faulted.tx_ref)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(faulted.status, TransactionStatus::Reverted);
    assert!(faulted.reason.expect("reason").contains("faulted"));

    let unregistered = store
        .transaction(&unregistered.tx_ref)
        .await
        .expect("lookup")
        .expect("exists");
    assert!(unregistered
        .reason
        .expect("reason")
        .contains("not registered"));

    let device = store.device(light(1)).await.expect("device").expect("exists");
    assert!(device.state.is_none());
}
