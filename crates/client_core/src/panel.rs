//! Optimistic view model for a control panel.
//!
//! The panel shows what the user asked for as soon as they ask for it and
//! only falls back to the ledger-confirmed state once no local or remote work
//! for that device is outstanding.

use std::collections::BTreeMap;

use shared::{
    domain::{DeviceKey, DeviceState},
    error::{ApiError, ErrorKind},
    protocol::{DevicePhase, RelayEvent, RelayResponse, StateResponse},
};
use uuid::Uuid;

use crate::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelStatus {
    Idle,
    /// Local intent waiting out the quiescence window.
    Debouncing,
    InFlight,
    /// The server holds the intent behind an in-flight transaction.
    Queued,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelEntry {
    pub device: DeviceKey,
    pub shown: Option<DeviceState>,
    pub confirmed: Option<DeviceState>,
    pub status: PanelStatus,
    pub last_error: Option<ApiError>,
    /// Client command whose HTTP answer is outstanding.
    dispatched: Option<Uuid>,
    /// Server command holding the device's transaction slot.
    in_flight: Option<Uuid>,
    /// Server command waiting behind `in_flight`.
    queued: Option<Uuid>,
}

impl PanelEntry {
    fn new(device: DeviceKey) -> Self {
        Self {
            device,
            shown: None,
            confirmed: None,
            status: PanelStatus::Idle,
            last_error: None,
            dispatched: None,
            in_flight: None,
            queued: None,
        }
    }

    /// Nothing local or remote is outstanding, so the confirmed state may be
    /// shown.
    fn is_quiet(&self) -> bool {
        self.status != PanelStatus::Debouncing
            && self.dispatched.is_none()
            && self.in_flight.is_none()
            && self.queued.is_none()
    }

    fn settle(&mut self, status: PanelStatus) {
        self.status = status;
        self.shown = self.confirmed;
    }
}

#[derive(Debug, Default, Clone)]
pub struct ControlPanel {
    entries: BTreeMap<DeviceKey, PanelEntry>,
}

impl ControlPanel {
    pub fn from_state(state: &StateResponse) -> Self {
        let mut panel = Self::default();
        panel.apply_state(state);
        panel
    }

    pub fn entry(&self, device: DeviceKey) -> Option<&PanelEntry> {
        self.entries.get(&device)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PanelEntry> {
        self.entries.values()
    }

    fn entry_mut(&mut self, device: DeviceKey) -> &mut PanelEntry {
        self.entries
            .entry(device)
            .or_insert_with(|| PanelEntry::new(device))
    }

    /// Records a user action before it is debounced.
    pub fn local_intent(&mut self, device: DeviceKey, desired: DeviceState) {
        let entry = self.entry_mut(device);
        entry.shown = Some(desired);
        entry.status = PanelStatus::Debouncing;
        entry.last_error = None;
    }

    /// Merges a server snapshot. Devices the user is still adjusting keep the
    /// locally shown value.
    pub fn apply_state(&mut self, state: &StateResponse) {
        for summary in &state.devices {
            let entry = self.entry_mut(summary.device());
            entry.confirmed = summary.confirmed_state;
            if summary.phase == DevicePhase::Idle {
                entry.in_flight = None;
            }
            if summary.queued_state.is_none() {
                entry.queued = None;
            }
            if entry.status == PanelStatus::Debouncing {
                continue;
            }
            entry.shown = summary.visible_state;
            entry.last_error = summary.last_error.clone();
            entry.status = if summary.queued_state.is_some() {
                PanelStatus::Queued
            } else if summary.phase != DevicePhase::Idle {
                PanelStatus::InFlight
            } else {
                match &summary.last_error {
                    Some(error) if entry.status != PanelStatus::Idle => {
                        PanelStatus::Failed(error.error)
                    }
                    _ => PanelStatus::Idle,
                }
            };
        }
    }

    pub fn apply_client_event(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Dispatched { command } => {
                let entry = self.entry_mut(command.device);
                entry.dispatched = Some(command.command_id);
                if entry.status == PanelStatus::Debouncing {
                    entry.status = PanelStatus::InFlight;
                }
            }
            ClientEvent::Relayed { command, response } => {
                let entry = self.entry_mut(command.device);
                let own = entry.dispatched == Some(command.command_id);
                match response {
                    RelayResponse::Success {
                        confirmed_state, ..
                    } => {
                        entry.confirmed = Some(*confirmed_state);
                        if own {
                            // Success is only answered for a command that
                            // took the free slot, so the slot was ours.
                            entry.dispatched = None;
                            entry.in_flight = None;
                        }
                        if entry.is_quiet() {
                            entry.last_error = None;
                            entry.settle(PanelStatus::Idle);
                        }
                    }
                    RelayResponse::Queued { queued_state } => {
                        if own {
                            entry.dispatched = None;
                            if entry.status != PanelStatus::Debouncing {
                                entry.shown = Some(*queued_state);
                                entry.status = PanelStatus::Queued;
                            }
                        }
                    }
                }
            }
            ClientEvent::RelayFailed { command, error } => {
                let entry = self.entry_mut(command.device);
                if entry.dispatched != Some(command.command_id) {
                    return;
                }
                entry.dispatched = None;
                entry.in_flight = None;
                entry.last_error = Some(error.clone());
                if entry.is_quiet() {
                    entry.settle(PanelStatus::Failed(error.error));
                }
            }
            ClientEvent::Relay(event) => self.apply_relay_event(event),
        }
    }

    pub fn apply_relay_event(&mut self, event: &RelayEvent) {
        let entry = self.entry_mut(event.device());
        match event {
            RelayEvent::CommandAccepted {
                command_id,
                requested_state,
                ..
            } => {
                entry.in_flight = Some(*command_id);
                if entry.queued == Some(*command_id) {
                    entry.queued = None;
                }
                if entry.status != PanelStatus::Debouncing && entry.dispatched.is_none() {
                    entry.shown = Some(*requested_state);
                    entry.status = PanelStatus::InFlight;
                }
            }
            RelayEvent::CommandQueued {
                command_id,
                requested_state,
                ..
            } => {
                entry.queued = Some(*command_id);
                if entry.status != PanelStatus::Debouncing {
                    entry.shown = Some(*requested_state);
                    entry.status = PanelStatus::Queued;
                }
            }
            RelayEvent::CommandSuperseded {
                command_id,
                superseded_by,
                ..
            } => {
                if entry.queued == Some(*command_id) {
                    entry.queued = Some(*superseded_by);
                }
            }
            RelayEvent::TransactionSubmitted { .. } => {}
            RelayEvent::CommandConfirmed {
                command_id,
                confirmed_state,
                ..
            } => {
                entry.confirmed = Some(*confirmed_state);
                if entry.in_flight == Some(*command_id) {
                    entry.in_flight = None;
                }
                if entry.is_quiet() {
                    entry.last_error = None;
                    entry.settle(PanelStatus::Idle);
                }
            }
            RelayEvent::CommandFailed {
                command_id, error, ..
            } => {
                if entry.in_flight == Some(*command_id) {
                    entry.in_flight = None;
                }
                entry.last_error = Some(error.clone());
                if entry.is_quiet() {
                    entry.settle(PanelStatus::Failed(error.error));
                }
            }
            RelayEvent::StateReconciled {
                confirmed_state, ..
            } => {
                entry.confirmed = *confirmed_state;
                if entry.is_quiet() {
                    entry.shown = *confirmed_state;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/panel_tests.rs"]
mod tests;
