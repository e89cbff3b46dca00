use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{DeviceClass, DeviceId, DeviceKey, DeviceState, RequestedState},
    error::ApiError,
};

pub fn relay_route() -> &'static str {
    "/relay"
}

pub fn state_route() -> &'static str {
    "/state"
}

pub fn events_route() -> &'static str {
    "/ws"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    #[serde(alias = "type")]
    pub device_class: DeviceClass,
    #[serde(alias = "id")]
    pub device_id: DeviceId,
    pub desired_state: RequestedState,
}

impl RelayRequest {
    pub fn device(&self) -> DeviceKey {
        DeviceKey {
            device_class: self.device_class,
            device_id: self.device_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RelayResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        tx_ref: String,
        confirmed_state: DeviceState,
        block_ordinal: u64,
    },
    #[serde(rename_all = "camelCase")]
    Queued { queued_state: DeviceState },
}

/// Lifecycle phase of the single in-flight transaction a device may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStatus {
    Submitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePhase {
    Idle,
    Submitting,
    AwaitingConfirmation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateSummary {
    pub device_class: DeviceClass,
    pub device_id: DeviceId,
    pub confirmed_state: Option<DeviceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<DeviceState>,
    pub visible_state: Option<DeviceState>,
    pub phase: DevicePhase,
    pub attempt: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_state: Option<DeviceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ApiError>,
}

impl DeviceStateSummary {
    pub fn device(&self) -> DeviceKey {
        DeviceKey {
            device_class: self.device_class,
            device_id: self.device_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub devices: Vec<DeviceStateSummary>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StateQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayEvent {
    CommandAccepted {
        device: DeviceKey,
        command_id: Uuid,
        requested_state: DeviceState,
    },
    CommandQueued {
        device: DeviceKey,
        command_id: Uuid,
        requested_state: DeviceState,
    },
    CommandSuperseded {
        device: DeviceKey,
        command_id: Uuid,
        superseded_by: Uuid,
    },
    TransactionSubmitted {
        device: DeviceKey,
        command_id: Uuid,
        tx_ref: String,
        attempt: u64,
    },
    CommandConfirmed {
        device: DeviceKey,
        command_id: Uuid,
        tx_ref: String,
        confirmed_state: DeviceState,
        block_ordinal: u64,
    },
    CommandFailed {
        device: DeviceKey,
        command_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_ref: Option<String>,
        error: ApiError,
    },
    StateReconciled {
        device: DeviceKey,
        confirmed_state: Option<DeviceState>,
        as_of_block: u64,
        at: DateTime<Utc>,
    },
}

impl RelayEvent {
    pub fn device(&self) -> DeviceKey {
        match self {
            RelayEvent::CommandAccepted { device, .. }
            | RelayEvent::CommandQueued { device, .. }
            | RelayEvent::CommandSuperseded { device, .. }
            | RelayEvent::TransactionSubmitted { device, .. }
            | RelayEvent::CommandConfirmed { device, .. }
            | RelayEvent::CommandFailed { device, .. }
            | RelayEvent::StateReconciled { device, .. } => *device,
        }
    }
}
