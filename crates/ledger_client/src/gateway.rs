//! JSON shapes spoken with a remote ledger gateway.

use serde::{Deserialize, Serialize};
use shared::domain::{DeviceClass, DeviceId, DeviceState};

pub fn transactions_route() -> &'static str {
    "/transactions"
}

pub fn transaction_route(tx_ref: &str) -> String {
    format!("/transactions/{tx_ref}")
}

pub fn device_route(class: DeviceClass, device_id: DeviceId) -> String {
    format!("/devices/{}/{}", class.as_str(), device_id.0)
}

pub fn signer_nonce_route(fingerprint: &str) -> String {
    format!("/signers/{fingerprint}/nonce")
}

/// Claims of the signed call envelope (HS256 JWT keyed by the signing
/// credential).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub method: String,
    pub device_class: DeviceClass,
    pub device_id: DeviceId,
    pub on: bool,
    pub level: u8,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTransactionRequest {
    pub envelope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTransactionResponse {
    pub tx_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayTransactionStatus {
    Pending,
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub status: GatewayTransactionStatus,
    #[serde(default)]
    pub block_ordinal: Option<u64>,
    #[serde(default)]
    pub state: Option<DeviceState>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReadingResponse {
    #[serde(default)]
    pub state: Option<DeviceState>,
    pub as_of_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceResponse {
    pub next_nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub error: String,
}
