use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::domain::{DeviceKey, Topology};
use storage::{LedgerStore, SealedBlock, TransactionStatus};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    signer_fingerprint, CallSpec, LedgerClient, LedgerError, Receipt, ReceiptOutcome,
    StateReading, TransactionHandle,
};

#[derive(Debug, Clone)]
pub struct DevLedgerConfig {
    /// Credential the relay signs with.
    pub signing_credential: String,
    /// Credential the ledger accepts writes from.
    pub owner_credential: String,
    pub block_time: Duration,
    pub poll_interval: Duration,
}

impl DevLedgerConfig {
    pub fn new(signing_credential: impl Into<String>) -> Self {
        let signing_credential = signing_credential.into();
        Self {
            owner_credential: signing_credential.clone(),
            signing_credential,
            block_time: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Local stand-in for the chain: transactions are appended to SQLite and a
/// block producer settles them on a fixed block time.
pub struct DevLedger {
    store: LedgerStore,
    config: DevLedgerConfig,
    signer: String,
    submit_lock: Mutex<()>,
}

impl DevLedger {
    pub fn new(store: LedgerStore, config: DevLedgerConfig) -> Self {
        let signer = signer_fingerprint(&config.signing_credential);
        Self {
            store,
            config,
            signer,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Registers every device of the topology; already deployed devices keep
    /// their state.
    pub async fn provision(&self, topology: &Topology) -> Result<(), LedgerError> {
        for device in topology.devices() {
            self.store
                .register_device(device)
                .await
                .map_err(store_error)?;
        }
        info!(devices = topology.devices().len(), "dev ledger provisioned");
        Ok(())
    }

    pub async fn produce_block(&self) -> Result<Option<SealedBlock>, LedgerError> {
        let sealed = self.store.seal_block().await.map_err(store_error)?;
        if let Some(block) = &sealed {
            info!(
                block = block.ordinal,
                confirmed = block.confirmed.len(),
                reverted = block.reverted.len(),
                "dev ledger sealed block"
            );
        }
        Ok(sealed)
    }

    pub fn spawn_block_producer(self: &Arc<Self>) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ledger.config.block_time);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = ledger.produce_block().await {
                    warn!(%error, "dev ledger failed to seal block");
                }
            }
        })
    }
}

#[async_trait]
impl LedgerClient for DevLedger {
    async fn submit(&self, call: CallSpec) -> Result<TransactionHandle, LedgerError> {
        if self.config.signing_credential != self.config.owner_credential {
            return Err(LedgerError::Rejected(format!(
                "signer {} is not authorized to call {}",
                self.signer,
                call.method()
            )));
        }

        let _guard = self.submit_lock.lock().await;
        let device = self
            .store
            .device(call.device)
            .await
            .map_err(store_error)?;
        if device.is_none() {
            return Err(LedgerError::Rejected(format!(
                "{} reverted during estimation: device {} is not deployed",
                call.method(),
                call.device
            )));
        }

        let stored = self
            .store
            .append_transaction(&self.signer, call.device, call.state)
            .await
            .map_err(store_error)?;
        debug!(
            device = %call.device,
            tx_ref = %stored.tx_ref,
            nonce = stored.nonce,
            method = call.method(),
            "dev ledger accepted transaction"
        );
        Ok(TransactionHandle {
            tx_ref: stored.tx_ref,
            nonce: stored.nonce,
        })
    }

    async fn await_confirmation(
        &self,
        handle: &TransactionHandle,
    ) -> Result<Receipt, LedgerError> {
        loop {
            let stored = self
                .store
                .transaction(&handle.tx_ref)
                .await
                .map_err(store_error)?
                .ok_or_else(|| LedgerError::UnknownTransaction(handle.tx_ref.clone()))?;

            let block_ordinal = stored.block_ordinal.unwrap_or_default();
            match stored.status {
                TransactionStatus::Pending => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                TransactionStatus::Confirmed => {
                    return Ok(Receipt {
                        handle: handle.clone(),
                        block_ordinal,
                        outcome: ReceiptOutcome::Confirmed(stored.requested_state),
                    });
                }
                TransactionStatus::Reverted => {
                    return Ok(Receipt {
                        handle: handle.clone(),
                        block_ordinal,
                        outcome: ReceiptOutcome::Reverted {
                            reason: stored
                                .reason
                                .unwrap_or_else(|| "execution reverted".to_string()),
                        },
                    });
                }
            }
        }
    }

    async fn query_state(&self, device: DeviceKey) -> Result<StateReading, LedgerError> {
        let head = self.store.head_block().await.map_err(store_error)?;
        let stored = self
            .store
            .device(device)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                LedgerError::Rejected(format!("device {device} is not deployed on the ledger"))
            })?;
        Ok(StateReading {
            state: stored.state,
            as_of_block: head.max(stored.updated_block),
        })
    }
}

fn store_error(error: anyhow::Error) -> LedgerError {
    LedgerError::Transport(format!("{error:#}"))
}
