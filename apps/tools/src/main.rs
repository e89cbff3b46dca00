use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{DeviceKey, Topology};
use storage::LedgerStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Administers the SQLite-backed development ledger.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/dev-ledger.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Registers devices `1..=count` for each class. Existing devices are kept.
    Init {
        #[arg(long, default_value_t = 3)]
        lights: u32,
        #[arg(long, default_value_t = 2)]
        heaters: u32,
        #[arg(long, default_value_t = 3)]
        doors: u32,
    },
    Devices,
    Txs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Makes every later transaction for the device revert.
    Fault { device: DeviceKey },
    Heal { device: DeviceKey },
    /// Seals pending transactions into a block right away.
    Seal,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let store = LedgerStore::new(&cli.database_url).await?;

    match cli.command {
        Command::Init {
            lights,
            heaters,
            doors,
        } => {
            let topology = Topology {
                lights,
                heaters,
                doors,
            };
            for device in topology.devices() {
                store.register_device(device).await?;
            }
            info!(lights, heaters, doors, "devices registered");
            println!("registered {} devices", topology.devices().len());
        }
        Command::Devices => {
            for device in store.list_devices().await? {
                let state = device
                    .state
                    .map(|state| state.to_string())
                    .unwrap_or_else(|| "unset".to_string());
                let fault = if device.faulted { " FAULTED" } else { "" };
                println!(
                    "{:<10} {:<8} block={}{}",
                    device.key.to_string(),
                    state,
                    device.updated_block,
                    fault
                );
            }
        }
        Command::Txs { limit } => {
            for tx in store.list_transactions(limit).await? {
                let block = tx
                    .block_ordinal
                    .map(|block| block.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "#{:<5} {} {:<10} {:<8} {:?} block={} {}",
                    tx.nonce,
                    tx.tx_ref,
                    tx.device.to_string(),
                    tx.requested_state.to_string(),
                    tx.status,
                    block,
                    tx.reason.unwrap_or_default()
                );
            }
        }
        Command::Fault { device } => set_fault(&store, device, true).await?,
        Command::Heal { device } => set_fault(&store, device, false).await?,
        Command::Seal => match store.seal_block().await? {
            Some(block) => println!(
                "sealed block {} ({} confirmed, {} reverted)",
                block.ordinal,
                block.confirmed.len(),
                block.reverted.len()
            ),
            None => println!("nothing pending"),
        },
    }

    Ok(())
}

async fn set_fault(store: &LedgerStore, device: DeviceKey, faulted: bool) -> Result<()> {
    if !store.set_faulted(device, faulted).await? {
        bail!("device {device} is not registered; run `init` first");
    }
    info!(%device, faulted, "device fault flag updated");
    println!("{device} faulted={faulted}");
    Ok(())
}
