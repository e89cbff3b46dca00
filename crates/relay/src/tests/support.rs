use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use ledger_client::{
    CallSpec, LedgerClient, LedgerError, Receipt, ReceiptOutcome, StateReading, TransactionHandle,
};
use shared::{
    domain::{DeviceClass, DeviceKey, DeviceState},
    protocol::RelayEvent,
};
use tokio::sync::{broadcast, oneshot, watch};

use crate::{DeviceSnapshot, RelayConfig, RelayService};

#[derive(Default)]
struct Script {
    calls: Vec<CallSpec>,
    txs: HashMap<String, CallSpec>,
    queries: usize,
    held: HashSet<DeviceKey>,
    rejected: HashSet<DeviceKey>,
    failing_reads: HashSet<DeviceKey>,
    auto_delay: Duration,
    gates: HashMap<String, oneshot::Receiver<ReceiptOutcome>>,
    waiting: VecDeque<(String, CallSpec, oneshot::Sender<ReceiptOutcome>)>,
    states: HashMap<DeviceKey, DeviceState>,
    block: u64,
    active: HashMap<DeviceKey, usize>,
    max_active_per_device: usize,
    max_active_total: usize,
}

impl Script {
    fn total_active(&self) -> usize {
        self.active.values().sum()
    }
}

/// In-memory ledger whose confirmations are released by the test. Devices
/// that are not held confirm on their own after `auto_delay`.
pub(crate) struct ScriptedLedger {
    script: Mutex<Script>,
    submitted: watch::Sender<usize>,
}

struct ActiveGuard<'a> {
    ledger: &'a ScriptedLedger,
    device: DeviceKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut script = self.ledger.script.lock().expect("script");
        if let Some(active) = script.active.get_mut(&self.device) {
            *active = active.saturating_sub(1);
        }
    }
}

impl ScriptedLedger {
    pub(crate) fn new() -> Arc<Self> {
        let (submitted, _) = watch::channel(0);
        Arc::new(Self {
            script: Mutex::new(Script::default()),
            submitted,
        })
    }

    pub(crate) fn hold(&self, device: DeviceKey) {
        self.script.lock().expect("script").held.insert(device);
    }

    pub(crate) fn release(&self, device: DeviceKey) {
        self.script.lock().expect("script").held.remove(&device);
    }

    pub(crate) fn reject(&self, device: DeviceKey) {
        self.script.lock().expect("script").rejected.insert(device);
    }

    pub(crate) fn fail_reads(&self, device: DeviceKey) {
        self.script.lock().expect("script").failing_reads.insert(device);
    }

    pub(crate) fn set_auto_delay(&self, delay: Duration) {
        self.script.lock().expect("script").auto_delay = delay;
    }

    /// Simulates a write by another party: the state changes in a new block.
    pub(crate) fn write_externally(&self, device: DeviceKey, state: DeviceState) {
        let mut script = self.script.lock().expect("script");
        script.block += 1;
        script.states.insert(device, state);
    }

    pub(crate) fn calls(&self) -> Vec<CallSpec> {
        self.script.lock().expect("script").calls.clone()
    }

    pub(crate) fn states_sent(&self, device: DeviceKey) -> Vec<DeviceState> {
        self.calls()
            .into_iter()
            .filter(|call| call.device == device)
            .map(|call| call.state)
            .collect()
    }

    pub(crate) fn queries(&self) -> usize {
        self.script.lock().expect("script").queries
    }

    pub(crate) fn max_active_per_device(&self) -> usize {
        self.script.lock().expect("script").max_active_per_device
    }

    pub(crate) fn max_active_total(&self) -> usize {
        self.script.lock().expect("script").max_active_total
    }

    pub(crate) async fn wait_for_submissions(&self, count: usize) {
        let mut submitted = self.submitted.subscribe();
        tokio::time::timeout(Duration::from_secs(120), submitted.wait_for(|n| *n >= count))
            .await
            .expect("submissions arrived in time")
            .expect("ledger alive");
    }

    /// Releases the oldest held transaction with the outcome built from its
    /// call.
    pub(crate) fn settle_next(&self, outcome: impl FnOnce(&CallSpec) -> ReceiptOutcome) -> String {
        let (tx_ref, call, sender) = self
            .script
            .lock()
            .expect("script")
            .waiting
            .pop_front()
            .expect("a held transaction");
        let _ = sender.send(outcome(&call));
        tx_ref
    }

    pub(crate) fn confirm_next(&self) -> String {
        self.settle_next(|call| ReceiptOutcome::Confirmed(call.state))
    }

    pub(crate) fn revert_next(&self, reason: &str) -> String {
        let reason = reason.to_string();
        self.settle_next(move |_| ReceiptOutcome::Reverted { reason })
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn submit(&self, call: CallSpec) -> Result<TransactionHandle, LedgerError> {
        let handle = {
            let mut script = self.script.lock().expect("script");
            script.calls.push(call);
            if script.rejected.contains(&call.device) {
                return Err(LedgerError::Rejected(format!(
                    "execution reverted: {} is offline",
                    call.device
                )));
            }

            let active = script.active.entry(call.device).or_default();
            *active += 1;
            let active = *active;
            script.max_active_per_device = script.max_active_per_device.max(active);
            let total = script.total_active();
            script.max_active_total = script.max_active_total.max(total);

            let nonce = script.calls.len() as u64;
            let tx_ref = format!("tx-{nonce}");
            script.txs.insert(tx_ref.clone(), call);
            if script.held.contains(&call.device) {
                let (sender, gate) = oneshot::channel();
                script.gates.insert(tx_ref.clone(), gate);
                script.waiting.push_back((tx_ref.clone(), call, sender));
            }
            TransactionHandle { tx_ref, nonce }
        };
        self.submitted.send_modify(|n| *n += 1);
        Ok(handle)
    }

    async fn await_confirmation(
        &self,
        handle: &TransactionHandle,
    ) -> Result<Receipt, LedgerError> {
        let (call, gate, delay) = {
            let mut script = self.script.lock().expect("script");
            let call = *script
                .txs
                .get(&handle.tx_ref)
                .ok_or_else(|| LedgerError::UnknownTransaction(handle.tx_ref.clone()))?;
            (call, script.gates.remove(&handle.tx_ref), script.auto_delay)
        };
        let _guard = ActiveGuard {
            ledger: self,
            device: call.device,
        };

        let outcome = match gate {
            Some(gate) => match gate.await {
                Ok(outcome) => outcome,
                Err(_) => std::future::pending().await,
            },
            None => {
                tokio::time::sleep(delay).await;
                ReceiptOutcome::Confirmed(call.state)
            }
        };

        let mut script = self.script.lock().expect("script");
        script.block += 1;
        if let ReceiptOutcome::Confirmed(state) = &outcome {
            script.states.insert(call.device, *state);
        }
        Ok(Receipt {
            handle: handle.clone(),
            block_ordinal: script.block,
            outcome,
        })
    }

    async fn query_state(&self, device: DeviceKey) -> Result<StateReading, LedgerError> {
        let mut script = self.script.lock().expect("script");
        script.queries += 1;
        if script.failing_reads.contains(&device) {
            return Err(LedgerError::Transport("connection reset by peer".to_string()));
        }
        Ok(StateReading {
            state: script.states.get(&device).copied(),
            as_of_block: script.block,
        })
    }
}

pub(crate) fn start(ledger: &Arc<ScriptedLedger>) -> RelayService {
    start_with_timeout(ledger, Duration::from_secs(60))
}

pub(crate) fn start_with_timeout(ledger: &Arc<ScriptedLedger>, timeout: Duration) -> RelayService {
    let config = RelayConfig {
        confirmation_timeout: timeout,
        ..RelayConfig::default()
    };
    let ledger: Arc<dyn LedgerClient> = ledger.clone();
    RelayService::start(config, ledger)
}

pub(crate) fn light(id: u32) -> DeviceKey {
    DeviceKey::new(DeviceClass::Light, id)
}

pub(crate) fn heater(id: u32) -> DeviceKey {
    DeviceKey::new(DeviceClass::Heater, id)
}

pub(crate) fn door(id: u32) -> DeviceKey {
    DeviceKey::new(DeviceClass::Door, id)
}

pub(crate) fn on(level: u8) -> DeviceState {
    DeviceState::on_at(level).expect("valid level")
}

pub(crate) async fn next_event(
    events: &mut broadcast::Receiver<RelayEvent>,
    matches: impl Fn(&RelayEvent) -> bool,
) -> RelayEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

pub(crate) async fn wait_for_snapshot(
    relay: &RelayService,
    device: DeviceKey,
    matches: impl Fn(&DeviceSnapshot) -> bool,
) -> DeviceSnapshot {
    let mut snapshots = relay.watch(device).expect("known device");
    let snapshot = tokio::time::timeout(
        Duration::from_secs(120),
        snapshots.wait_for(|snapshot| matches(snapshot)),
    )
    .await
    .expect("snapshot reached in time")
    .expect("actor alive");
    (*snapshot).clone()
}
