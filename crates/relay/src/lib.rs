//! Relay core: one actor per device serializes that device's ledger writes,
//! buffers the latest intent while a transaction is in flight, and publishes
//! a snapshot after every transition. The [`Reconciler`] refreshes confirmed
//! state from the ledger on an interval.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use ledger_client::{LedgerClient, StateReading};
use shared::{
    domain::{Command, DeviceKey, DeviceState, RequestedState, Topology},
    error::RelayError,
    protocol::{DeviceStateSummary, RelayEvent, RelayResponse},
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::info;

mod actor;
mod reconciler;

use actor::{DeviceActor, DeviceMessage};
pub use actor::{DeviceSnapshot, Observation, PendingSummary};
pub use reconciler::{ReconcileReport, Reconciler};

pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub topology: Topology,
    pub confirmation_timeout: Duration,
    pub mailbox_capacity: usize,
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            mailbox_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// What a relay call resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Success {
        tx_ref: String,
        confirmed_state: DeviceState,
        block_ordinal: u64,
    },
    Queued {
        queued_state: DeviceState,
    },
}

impl From<RelayOutcome> for RelayResponse {
    fn from(value: RelayOutcome) -> Self {
        match value {
            RelayOutcome::Success {
                tx_ref,
                confirmed_state,
                block_ordinal,
            } => RelayResponse::Success {
                tx_ref,
                confirmed_state,
                block_ordinal,
            },
            RelayOutcome::Queued { queued_state } => RelayResponse::Queued { queued_state },
        }
    }
}

struct DeviceHandle {
    mailbox: mpsc::Sender<DeviceMessage>,
    snapshot: watch::Receiver<DeviceSnapshot>,
}

struct RelayInner {
    devices: BTreeMap<DeviceKey, DeviceHandle>,
    events: broadcast::Sender<RelayEvent>,
    ledger: Arc<dyn LedgerClient>,
}

#[derive(Clone)]
pub struct RelayService {
    inner: Arc<RelayInner>,
}

impl RelayService {
    /// Spawns one actor per device of the topology. Must be called from
    /// within a tokio runtime.
    pub fn start(config: RelayConfig, ledger: Arc<dyn LedgerClient>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut devices = BTreeMap::new();

        for key in config.topology.devices() {
            let (mailbox, inbox) = mpsc::channel(config.mailbox_capacity.max(1));
            let (actor, snapshot) = DeviceActor::new(
                key,
                Arc::clone(&ledger),
                config.confirmation_timeout,
                inbox,
                events.clone(),
            );
            tokio::spawn(actor.run());
            devices.insert(key, DeviceHandle { mailbox, snapshot });
        }

        info!(
            lights = config.topology.lights,
            heaters = config.topology.heaters,
            doors = config.topology.doors,
            confirmation_timeout_secs = config.confirmation_timeout.as_secs(),
            "relay service started"
        );

        Self {
            inner: Arc::new(RelayInner {
                devices,
                events,
                ledger,
            }),
        }
    }

    pub fn ledger(&self) -> Arc<dyn LedgerClient> {
        Arc::clone(&self.inner.ledger)
    }

    pub fn devices(&self) -> Vec<DeviceKey> {
        self.inner.devices.keys().copied().collect()
    }

    /// Validates and forwards one intent. Resolves with `Success` once the
    /// ledger confirms it, or at once with `Queued` when the device already
    /// has a transaction in flight.
    pub async fn relay(
        &self,
        device: DeviceKey,
        requested: RequestedState,
    ) -> Result<RelayOutcome, RelayError> {
        let handle = self.handle(device)?;
        let state = requested.validate()?;
        self.dispatch(handle, Command::new(device, state)).await
    }

    pub async fn relay_command(&self, command: Command) -> Result<RelayOutcome, RelayError> {
        let handle = self.handle(command.device)?;
        self.dispatch(handle, command).await
    }

    pub fn snapshot(&self, device: DeviceKey) -> Option<DeviceSnapshot> {
        self.inner
            .devices
            .get(&device)
            .map(|handle| handle.snapshot.borrow().clone())
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.inner
            .devices
            .values()
            .map(|handle| handle.snapshot.borrow().clone())
            .collect()
    }

    pub fn watch(&self, device: DeviceKey) -> Option<watch::Receiver<DeviceSnapshot>> {
        self.inner
            .devices
            .get(&device)
            .map(|handle| handle.snapshot.clone())
    }

    pub fn state_summaries(&self) -> Vec<DeviceStateSummary> {
        self.snapshots().iter().map(DeviceSnapshot::summary).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Hands a fresh ledger reading to the device's actor and waits until it
    /// has been applied or set aside.
    pub async fn observe(
        &self,
        device: DeviceKey,
        reading: StateReading,
    ) -> Result<Observation, RelayError> {
        let handle = self.handle(device)?;
        let (ack, applied) = oneshot::channel();
        handle
            .mailbox
            .send(DeviceMessage::Observed {
                reading,
                ack: Some(ack),
            })
            .await
            .map_err(|_| actor_gone(device))?;
        applied.await.map_err(|_| actor_gone(device))
    }

    fn handle(&self, device: DeviceKey) -> Result<&DeviceHandle, RelayError> {
        self.inner
            .devices
            .get(&device)
            .ok_or_else(|| RelayError::UnknownDevice(device.to_string()))
    }

    async fn dispatch(
        &self,
        handle: &DeviceHandle,
        command: Command,
    ) -> Result<RelayOutcome, RelayError> {
        let device = command.device;
        let (reply, outcome) = oneshot::channel();
        handle
            .mailbox
            .send(DeviceMessage::Intent { command, reply })
            .await
            .map_err(|_| actor_gone(device))?;
        outcome.await.map_err(|_| actor_gone(device))?
    }
}

fn actor_gone(device: DeviceKey) -> RelayError {
    RelayError::Internal(format!("actor for {device} is not running"))
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod support;

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod relay_tests;

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod reconciler_tests;
