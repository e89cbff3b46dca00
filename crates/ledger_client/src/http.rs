use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::domain::DeviceKey;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::{
    gateway::{
        device_route, signer_nonce_route, transaction_route, transactions_route,
        DeviceReadingResponse, EnvelopeClaims, GatewayError, GatewayTransactionStatus,
        NonceResponse, SubmitTransactionRequest, SubmitTransactionResponse,
        TransactionStatusResponse,
    },
    signer_fingerprint, CallSpec, LedgerClient, LedgerError, Receipt, ReceiptOutcome,
    StateReading, TransactionHandle,
};

const ENVELOPE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct HttpLedgerConfig {
    pub endpoint: Url,
    pub signing_credential: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl HttpLedgerConfig {
    pub fn new(endpoint: Url, signing_credential: impl Into<String>) -> Self {
        Self {
            endpoint,
            signing_credential: signing_credential.into(),
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            max_retries: 4,
            initial_retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Talks to a JSON ledger gateway. Calls are signed envelopes; the signer's
/// nonce is handed out under a single lock so concurrent device actors never
/// reuse or skip one.
pub struct HttpLedgerClient {
    http: Client,
    config: HttpLedgerConfig,
    signer: String,
    next_nonce: Mutex<Option<u64>>,
}

impl HttpLedgerClient {
    pub fn new(config: HttpLedgerConfig) -> Result<Self, LedgerError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("failed to build HTTP client: {e}")))?;
        let signer = signer_fingerprint(&config.signing_credential);
        Ok(Self {
            http,
            config,
            signer,
            next_nonce: Mutex::new(None),
        })
    }

    pub fn signer(&self) -> &str {
        &self.signer
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.config.endpoint.as_str().trim_end_matches('/'),
            path
        )
    }

    fn sign(&self, call: CallSpec, nonce: u64) -> Result<String, LedgerError> {
        let now = Utc::now().timestamp();
        let claims = EnvelopeClaims {
            iss: self.signer.clone(),
            iat: now,
            exp: now + ENVELOPE_TTL_SECS,
            method: call.method().to_string(),
            device_class: call.device.device_class,
            device_id: call.device.device_id,
            on: call.state.on,
            level: call.state.level.get(),
            nonce,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.signing_credential.as_bytes()),
        )
        .map_err(|e| LedgerError::Rejected(format!("failed to sign {}: {e}", call.method())))
    }

    /// Retries transport failures with capped exponential backoff. Rejections
    /// are returned at once.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            attempt += 1;
            match attempt_fn().await {
                Err(LedgerError::Transport(reason)) if attempt <= self.config.max_retries => {
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "ledger gateway call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                }
                other => return other,
            }
        }
    }

    async fn fetch_next_nonce(&self) -> Result<u64, LedgerError> {
        let url = self.url(&signer_nonce_route(&self.signer));
        let response: NonceResponse = self
            .with_retry("fetch_nonce", || async {
                let response = self.http.get(&url).send().await.map_err(transport)?;
                decode(response).await
            })
            .await?;
        debug!(signer = %self.signer, next_nonce = response.next_nonce, "fetched signer nonce");
        Ok(response.next_nonce)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn submit(&self, call: CallSpec) -> Result<TransactionHandle, LedgerError> {
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self.fetch_next_nonce().await?,
        };
        let request = SubmitTransactionRequest {
            envelope: self.sign(call, nonce)?,
        };
        let url = self.url(transactions_route());

        // The gateway deduplicates on (signer, nonce), so resending the same
        // envelope after a transport failure cannot double-apply.
        let result: Result<SubmitTransactionResponse, LedgerError> = self
            .with_retry("submit", || async {
                let response = self
                    .http
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(transport)?;
                decode(response).await
            })
            .await;

        match result {
            Ok(accepted) => {
                *next_nonce = Some(nonce + 1);
                debug!(
                    device = %call.device,
                    tx_ref = %accepted.tx_ref,
                    nonce,
                    method = call.method(),
                    "ledger gateway accepted transaction"
                );
                Ok(TransactionHandle {
                    tx_ref: accepted.tx_ref,
                    nonce,
                })
            }
            Err(error) => {
                // Re-read the nonce next time; we no longer know whether this
                // one was consumed.
                *next_nonce = None;
                Err(error)
            }
        }
    }

    async fn await_confirmation(
        &self,
        handle: &TransactionHandle,
    ) -> Result<Receipt, LedgerError> {
        let url = self.url(&transaction_route(&handle.tx_ref));
        loop {
            let status: TransactionStatusResponse = self
                .with_retry("await_confirmation", || async {
                    let response = self.http.get(&url).send().await.map_err(transport)?;
                    if response.status() == StatusCode::NOT_FOUND {
                        return Err(LedgerError::UnknownTransaction(handle.tx_ref.clone()));
                    }
                    decode(response).await
                })
                .await?;

            let block_ordinal = status.block_ordinal.unwrap_or_default();
            match status.status {
                GatewayTransactionStatus::Pending => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                GatewayTransactionStatus::Confirmed => {
                    let state = status.state.ok_or_else(|| {
                        LedgerError::Transport(format!(
                            "gateway confirmed {} without reporting the settled state",
                            handle.tx_ref
                        ))
                    })?;
                    return Ok(Receipt {
                        handle: handle.clone(),
                        block_ordinal,
                        outcome: ReceiptOutcome::Confirmed(state),
                    });
                }
                GatewayTransactionStatus::Reverted => {
                    return Ok(Receipt {
                        handle: handle.clone(),
                        block_ordinal,
                        outcome: ReceiptOutcome::Reverted {
                            reason: status
                                .reason
                                .unwrap_or_else(|| "execution reverted".to_string()),
                        },
                    });
                }
            }
        }
    }

    async fn query_state(&self, device: DeviceKey) -> Result<StateReading, LedgerError> {
        let url = self.url(&device_route(device.device_class, device.device_id));
        let reading: DeviceReadingResponse = self
            .with_retry("query_state", || async {
                let response = self.http.get(&url).send().await.map_err(transport)?;
                decode(response).await
            })
            .await?;
        Ok(StateReading {
            state: reading.state,
            as_of_block: reading.as_of_block,
        })
    }
}

fn transport(error: reqwest::Error) -> LedgerError {
    LedgerError::Transport(error.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, LedgerError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::Transport(format!("malformed gateway response: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<GatewayError>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    if status.is_client_error() {
        Err(LedgerError::Rejected(format!("HTTP {status}: {detail}")))
    } else {
        Err(LedgerError::Transport(format!("HTTP {status}: {detail}")))
    }
}
