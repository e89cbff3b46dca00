//! Seam between the relay core and the external ledger.
//!
//! The relay only ever sees [`LedgerClient`]; the concrete adapter decides how
//! calls are signed, ordered and transported. Ordering of nonces for the one
//! signer the relay holds is the adapter's responsibility, so every
//! implementation must tolerate concurrent calls from many device actors.

use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{
    domain::{DeviceClass, DeviceKey, DeviceState},
    error::RelayError,
};
use thiserror::Error;

mod dev;
pub mod gateway;
mod http;

pub use dev::{DevLedger, DevLedgerConfig};
pub use http::{HttpLedgerClient, HttpLedgerConfig};

/// One state-changing contract call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSpec {
    pub device: DeviceKey,
    pub state: DeviceState,
}

impl CallSpec {
    pub fn new(device: DeviceKey, state: DeviceState) -> Self {
        Self { device, state }
    }

    pub fn method(&self) -> &'static str {
        match self.device.device_class {
            DeviceClass::Light => "setLight",
            DeviceClass::Heater => "setHeater",
            DeviceClass::Door => "setDoor",
        }
    }
}

pub fn query_method(class: DeviceClass) -> &'static str {
    match class {
        DeviceClass::Light => "getLight",
        DeviceClass::Heater => "getHeater",
        DeviceClass::Door => "getDoor",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionHandle {
    pub tx_ref: String,
    pub nonce: u64,
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tx_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Confirmed(DeviceState),
    Reverted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub handle: TransactionHandle,
    pub block_ordinal: u64,
    pub outcome: ReceiptOutcome,
}

/// Result of a read-only query. `state` is `None` until the device has been
/// written at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReading {
    pub state: Option<DeviceState>,
    pub as_of_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Transport(String),
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),
}

impl From<LedgerError> for RelayError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Rejected(reason) => RelayError::Submission(reason),
            LedgerError::Transport(reason) => RelayError::Transport(reason),
            LedgerError::UnknownTransaction(tx_ref) => {
                RelayError::Confirmation(format!("ledger lost track of transaction {tx_ref}"))
            }
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit(&self, call: CallSpec) -> Result<TransactionHandle, LedgerError>;
    async fn await_confirmation(&self, handle: &TransactionHandle)
        -> Result<Receipt, LedgerError>;
    async fn query_state(&self, device: DeviceKey) -> Result<StateReading, LedgerError>;
}

/// Public, non-secret identity of a signing credential.
pub fn signer_fingerprint(signing_credential: &str) -> String {
    let digest = Sha256::digest(signing_credential.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}

#[cfg(test)]
#[path = "tests/dev_tests.rs"]
mod dev_tests;

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod http_tests;
