use std::sync::Arc;

use anyhow::Context;
use ledger_client::{DevLedger, DevLedgerConfig, HttpLedgerClient, HttpLedgerConfig, LedgerClient};
use storage::LedgerStore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{LedgerBackend, Settings};

pub(crate) struct LedgerHandle {
    pub(crate) client: Arc<dyn LedgerClient>,
    pub(crate) block_producer: Option<JoinHandle<()>>,
}

impl LedgerHandle {
    pub(crate) fn shutdown(self) {
        if let Some(producer) = self.block_producer {
            producer.abort();
        }
    }
}

pub(crate) async fn connect_ledger(settings: &Settings) -> anyhow::Result<LedgerHandle> {
    match settings.ledger_backend()? {
        LedgerBackend::Dev { database_url } => {
            let store = LedgerStore::new(&database_url).await.map_err(|error| {
                error!(
                    %database_url,
                    %error,
                    "failed to open development ledger; verify the directory is writable"
                );
                error
            })?;

            let mut config = DevLedgerConfig::new(settings.signing_credential.clone());
            config.owner_credential = settings.owner_credential().to_string();
            config.block_time = settings.dev_block_time();

            let ledger = Arc::new(DevLedger::new(store, config));
            ledger
                .provision(&settings.topology)
                .await
                .context("failed to deploy devices to the development ledger")?;
            let block_producer = ledger.spawn_block_producer();
            info!(
                %database_url,
                block_time_ms = settings.dev_block_time_ms,
                "using development ledger"
            );

            Ok(LedgerHandle {
                client: ledger,
                block_producer: Some(block_producer),
            })
        }
        LedgerBackend::Gateway { endpoint } => {
            let config = HttpLedgerConfig::new(endpoint.clone(), &settings.signing_credential);
            let client =
                HttpLedgerClient::new(config).context("failed to build ledger gateway client")?;
            info!(%endpoint, signer = client.signer(), "using ledger gateway");
            Ok(LedgerHandle {
                client: Arc::new(client),
                block_producer: None,
            })
        }
    }
}
