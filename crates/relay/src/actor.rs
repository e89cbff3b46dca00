use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use ledger_client::{
    CallSpec, LedgerClient, LedgerError, Receipt, ReceiptOutcome, StateReading, TransactionHandle,
};
use shared::{
    domain::{Command, DeviceKey, DeviceState},
    error::{ApiError, RelayError},
    protocol::{DevicePhase, DeviceStateSummary, PendingStatus, RelayEvent},
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::RelayOutcome;

pub(crate) type OutcomeReply = oneshot::Sender<Result<RelayOutcome, RelayError>>;

pub(crate) enum DeviceMessage {
    Intent {
        command: Command,
        reply: OutcomeReply,
    },
    Observed {
        reading: StateReading,
        ack: Option<oneshot::Sender<Observation>>,
    },
}

/// What the actor did with a fresh ledger reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Applied,
    KeptOptimistic,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub command_id: Uuid,
    pub requested_state: DeviceState,
    pub attempt: u64,
    pub status: PendingStatus,
    pub tx_ref: Option<String>,
}

/// Read-only view of one device, published by its actor after every
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device: DeviceKey,
    pub desired: Option<DeviceState>,
    pub confirmed: Option<DeviceState>,
    pub confirmed_at_block: u64,
    pub last_observed: Option<StateReading>,
    pub pending: Option<PendingSummary>,
    pub queued: Option<DeviceState>,
    pub attempts: u64,
    pub last_error: Option<ApiError>,
}

impl DeviceSnapshot {
    fn new(device: DeviceKey) -> Self {
        Self {
            device,
            desired: None,
            confirmed: None,
            confirmed_at_block: 0,
            last_observed: None,
            pending: None,
            queued: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn phase(&self) -> DevicePhase {
        match self.pending.as_ref().map(|pending| pending.status) {
            None | Some(PendingStatus::Confirmed) | Some(PendingStatus::Failed) => {
                DevicePhase::Idle
            }
            Some(PendingStatus::Submitting) => DevicePhase::Submitting,
            Some(PendingStatus::AwaitingConfirmation) => DevicePhase::AwaitingConfirmation,
        }
    }

    /// The optimistic intent wins while anything is in flight; otherwise the
    /// ledger's confirmed value is shown.
    pub fn visible_state(&self) -> Option<DeviceState> {
        if self.pending.is_some() || self.queued.is_some() {
            self.desired.or(self.confirmed)
        } else {
            self.confirmed
        }
    }

    pub fn summary(&self) -> DeviceStateSummary {
        DeviceStateSummary {
            device_class: self.device.device_class,
            device_id: self.device.device_id,
            confirmed_state: self.confirmed,
            desired_state: self.desired,
            visible_state: self.visible_state(),
            phase: self.phase(),
            attempt: self
                .pending
                .as_ref()
                .map(|pending| pending.attempt)
                .unwrap_or(self.attempts),
            tx_ref: self.pending.as_ref().and_then(|pending| pending.tx_ref.clone()),
            queued_state: self.queued,
            last_error: self.last_error.clone(),
        }
    }
}

struct PendingEntry {
    command: Command,
    handle: Option<TransactionHandle>,
    attempt: u64,
    status: PendingStatus,
    waiter: Option<OutcomeReply>,
}

enum Step {
    Submitted(Result<TransactionHandle, LedgerError>),
    Settled(Result<Receipt, LedgerError>),
    TimedOut,
}

type InFlight = BoxFuture<'static, Step>;

pub(crate) struct DeviceActor {
    key: DeviceKey,
    ledger: Arc<dyn LedgerClient>,
    confirmation_timeout: Duration,
    mailbox: mpsc::Receiver<DeviceMessage>,
    events: broadcast::Sender<RelayEvent>,
    published: watch::Sender<DeviceSnapshot>,
    view: DeviceSnapshot,
    pending: Option<PendingEntry>,
    next_desired: Option<Command>,
}

impl DeviceActor {
    pub(crate) fn new(
        key: DeviceKey,
        ledger: Arc<dyn LedgerClient>,
        confirmation_timeout: Duration,
        mailbox: mpsc::Receiver<DeviceMessage>,
        events: broadcast::Sender<RelayEvent>,
    ) -> (Self, watch::Receiver<DeviceSnapshot>) {
        let (published, snapshot) = watch::channel(DeviceSnapshot::new(key));
        (
            Self {
                key,
                ledger,
                confirmation_timeout,
                mailbox,
                events,
                published,
                view: DeviceSnapshot::new(key),
                pending: None,
                next_desired: None,
            },
            snapshot,
        )
    }

    pub(crate) async fn run(mut self) {
        let mut in_flight: Option<InFlight> = None;
        loop {
            tokio::select! {
                Some(step) = poll_in_flight(&mut in_flight) => {
                    in_flight = self.on_step(step);
                }
                message = self.mailbox.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Some(started) = self.on_message(message) {
                        in_flight = Some(started);
                    }
                }
            }
            self.publish();
        }
        debug!(device = %self.key, "device actor stopped");
    }

    fn on_message(&mut self, message: DeviceMessage) -> Option<InFlight> {
        match message {
            DeviceMessage::Intent { command, reply } => self.on_intent(command, reply),
            DeviceMessage::Observed { reading, ack } => {
                let observation = self.on_observed(reading);
                if let Some(ack) = ack {
                    let _ = ack.send(observation);
                }
                None
            }
        }
    }

    fn on_intent(&mut self, command: Command, reply: OutcomeReply) -> Option<InFlight> {
        self.view.desired = Some(command.requested_state);

        if self.pending.is_none() {
            return Some(self.begin(command, Some(reply)));
        }

        let queued_state = command.requested_state;
        let _ = self.events.send(RelayEvent::CommandQueued {
            device: self.key,
            command_id: command.command_id,
            requested_state: queued_state,
        });
        if let Some(superseded) = self.next_desired.replace(command.clone()) {
            debug!(
                device = %self.key,
                superseded = %superseded.command_id,
                by = %command.command_id,
                "queued intent superseded"
            );
            let _ = self.events.send(RelayEvent::CommandSuperseded {
                device: self.key,
                command_id: superseded.command_id,
                superseded_by: command.command_id,
            });
        }
        info!(device = %self.key, state = %queued_state, "device busy, intent queued");
        self.publish();
        let _ = reply.send(Ok(RelayOutcome::Queued { queued_state }));
        None
    }

    fn on_observed(&mut self, reading: StateReading) -> Observation {
        self.view.last_observed = Some(reading);

        if reading.as_of_block < self.view.confirmed_at_block {
            debug!(
                device = %self.key,
                as_of_block = reading.as_of_block,
                confirmed_at_block = self.view.confirmed_at_block,
                "ignoring reading older than last confirmation"
            );
            return Observation::Stale;
        }

        if self.pending.is_some() || self.next_desired.is_some() {
            debug!(device = %self.key, "reading recorded, keeping in-flight intent visible");
            return Observation::KeptOptimistic;
        }

        if self.view.confirmed != reading.state {
            info!(
                device = %self.key,
                as_of_block = reading.as_of_block,
                "confirmed state refreshed from ledger"
            );
        }
        self.view.confirmed = reading.state;
        self.view.confirmed_at_block = reading.as_of_block;
        let _ = self.events.send(RelayEvent::StateReconciled {
            device: self.key,
            confirmed_state: reading.state,
            as_of_block: reading.as_of_block,
            at: Utc::now(),
        });
        Observation::Applied
    }

    fn begin(&mut self, command: Command, waiter: Option<OutcomeReply>) -> InFlight {
        self.view.attempts += 1;
        let attempt = self.view.attempts;
        let call = CallSpec::new(self.key, command.requested_state);

        info!(
            device = %self.key,
            command_id = %command.command_id,
            state = %command.requested_state,
            attempt,
            "submitting command to ledger"
        );
        let _ = self.events.send(RelayEvent::CommandAccepted {
            device: self.key,
            command_id: command.command_id,
            requested_state: command.requested_state,
        });

        self.pending = Some(PendingEntry {
            command,
            handle: None,
            attempt,
            status: PendingStatus::Submitting,
            waiter,
        });

        let ledger = Arc::clone(&self.ledger);
        async move { Step::Submitted(ledger.submit(call).await) }.boxed()
    }

    fn await_receipt(&self, handle: TransactionHandle) -> InFlight {
        let ledger = Arc::clone(&self.ledger);
        let timeout = self.confirmation_timeout;
        async move {
            match tokio::time::timeout(timeout, ledger.await_confirmation(&handle)).await {
                Ok(settled) => Step::Settled(settled),
                Err(_) => Step::TimedOut,
            }
        }
        .boxed()
    }

    fn on_step(&mut self, step: Step) -> Option<InFlight> {
        match step {
            Step::Submitted(Ok(handle)) => {
                let Some(pending) = self.pending.as_mut() else {
                    warn!(
                        device = %self.key,
                        tx_ref = %handle,
                        "submission finished with no pending entry"
                    );
                    return self.start_next();
                };
                pending.status = PendingStatus::AwaitingConfirmation;
                pending.handle = Some(handle.clone());
                info!(
                    device = %self.key,
                    tx_ref = %handle,
                    nonce = handle.nonce,
                    "transaction accepted, awaiting confirmation"
                );
                let _ = self.events.send(RelayEvent::TransactionSubmitted {
                    device: self.key,
                    command_id: pending.command.command_id,
                    tx_ref: handle.tx_ref.clone(),
                    attempt: pending.attempt,
                });
                Some(self.await_receipt(handle))
            }
            Step::Submitted(Err(error)) => {
                self.fail(RelayError::from(error));
                self.start_next()
            }
            Step::Settled(Ok(receipt)) => {
                match receipt.outcome {
                    ReceiptOutcome::Confirmed(state) => {
                        self.confirm(state, receipt.handle, receipt.block_ordinal)
                    }
                    ReceiptOutcome::Reverted { reason } => {
                        self.fail(RelayError::Confirmation(reason))
                    }
                }
                self.start_next()
            }
            Step::Settled(Err(error)) => {
                let error = match error {
                    LedgerError::Rejected(reason) => RelayError::Confirmation(reason),
                    other => RelayError::from(other),
                };
                self.fail(error);
                self.start_next()
            }
            Step::TimedOut => {
                self.fail(RelayError::Timeout(self.confirmation_timeout.as_secs()));
                self.start_next()
            }
        }
    }

    fn confirm(&mut self, state: DeviceState, handle: TransactionHandle, block_ordinal: u64) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        pending.status = PendingStatus::Confirmed;

        if block_ordinal >= self.view.confirmed_at_block {
            self.view.confirmed = Some(state);
            self.view.confirmed_at_block = block_ordinal;
        }
        self.view.last_error = None;

        info!(
            device = %self.key,
            tx_ref = %handle,
            block = block_ordinal,
            state = %state,
            status = ?pending.status,
            "command confirmed"
        );
        let _ = self.events.send(RelayEvent::CommandConfirmed {
            device: self.key,
            command_id: pending.command.command_id,
            tx_ref: handle.tx_ref.clone(),
            confirmed_state: state,
            block_ordinal,
        });
        self.publish();
        if let Some(waiter) = pending.waiter.take() {
            let _ = waiter.send(Ok(RelayOutcome::Success {
                tx_ref: handle.tx_ref,
                confirmed_state: state,
                block_ordinal,
            }));
        }
    }

    fn fail(&mut self, error: RelayError) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        pending.status = PendingStatus::Failed;
        let tx_ref = pending.handle.as_ref().map(|handle| handle.tx_ref.clone());

        warn!(
            device = %self.key,
            command_id = %pending.command.command_id,
            tx_ref = tx_ref.as_deref().unwrap_or("-"),
            kind = ?error.kind(),
            %error,
            status = ?pending.status,
            "command failed"
        );
        let api_error = ApiError::from(error.clone());
        self.view.last_error = Some(api_error.clone());
        let _ = self.events.send(RelayEvent::CommandFailed {
            device: self.key,
            command_id: pending.command.command_id,
            tx_ref,
            error: api_error,
        });
        self.publish();
        if let Some(waiter) = pending.waiter.take() {
            let _ = waiter.send(Err(error));
        }
    }

    fn start_next(&mut self) -> Option<InFlight> {
        let command = self.next_desired.take()?;
        Some(self.begin(command, None))
    }

    /// Callers are answered only after the view they will observe has been
    /// published.
    fn publish(&mut self) {
        self.view.pending = self.pending.as_ref().map(|pending| PendingSummary {
            command_id: pending.command.command_id,
            requested_state: pending.command.requested_state,
            attempt: pending.attempt,
            status: pending.status,
            tx_ref: pending.handle.as_ref().map(|handle| handle.tx_ref.clone()),
        });
        self.view.queued = self
            .next_desired
            .as_ref()
            .map(|command| command.requested_state);
        self.published.send_replace(self.view.clone());
    }
}

async fn poll_in_flight(in_flight: &mut Option<InFlight>) -> Option<Step> {
    match in_flight.as_mut() {
        Some(future) => Some(future.await),
        None => std::future::pending().await,
    }
}
