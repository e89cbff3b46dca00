use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{ClientEvent, ClientSession, ControlPanel, PanelEntry, RelayHttpClient};
use shared::{
    domain::{DeviceKey, RequestedState},
    protocol::RelayResponse,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Control panel for the ledger relay")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    /// Quiet period before a burst of intents is sent as one command.
    #[arg(long, default_value_t = 500)]
    quiescence_ms: u64,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Power {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Prints every device's confirmed and visible state.
    State {
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Sets one device, e.g. `set heater2 on --level 45`.
    Set {
        device: DeviceKey,
        power: Power,
        #[arg(long)]
        level: Option<i64>,
    },
    /// Streams relay events and the resulting panel view until ctrl-c.
    Watch,
    /// Drags a device's level like a slider; only the final value is relayed.
    Sweep {
        device: DeviceKey,
        #[arg(long, default_value_t = 0)]
        from: i64,
        #[arg(long, default_value_t = 100)]
        to: i64,
        #[arg(long, default_value_t = 10)]
        step: i64,
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let client = Arc::new(RelayHttpClient::new(&args.server_url)?);
    let quiescence = Duration::from_millis(args.quiescence_ms);

    match args.command {
        Cmd::State { refresh, json } => {
            let state = client.state(refresh).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                for entry in ControlPanel::from_state(&state).entries() {
                    print_entry(entry);
                }
            }
        }
        Cmd::Set {
            device,
            power,
            level,
        } => {
            let session = ClientSession::new(client.clone(), quiescence);
            let mut events = session.subscribe();
            let requested = RequestedState {
                on: matches!(power, Power::On),
                level,
            };
            let desired = session.submit_intent(device, requested)?;
            println!("{device} -> {desired}");
            await_outcome(&mut events, device).await?;
        }
        Cmd::Watch => watch(&client).await?,
        Cmd::Sweep {
            device,
            from,
            to,
            step,
            interval_ms,
        } => {
            if step <= 0 {
                bail!("--step must be positive");
            }
            let session = ClientSession::new(client.clone(), quiescence);
            let mut events = session.subscribe();
            let levels: Vec<i64> = if from <= to {
                (from..=to).step_by(step as usize).collect()
            } else {
                (to..=from).rev().step_by(step as usize).collect()
            };
            for level in &levels {
                session.submit_intent(
                    device,
                    RequestedState {
                        on: true,
                        level: Some(*level),
                    },
                )?;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
            println!("{} intents submitted for {device}", levels.len());
            await_outcome(&mut events, device).await?;
        }
    }

    Ok(())
}

async fn watch(client: &RelayHttpClient) -> Result<()> {
    let mut panel = ControlPanel::from_state(&client.state(false).await?);
    for entry in panel.entries() {
        print_entry(entry);
    }
    let mut subscription = client
        .subscribe_events()
        .await
        .context("failed to open event stream")?;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    println!("event stream closed by server");
                    break;
                };
                println!("{}", serde_json::to_string(&event)?);
                let device = event.device();
                panel.apply_relay_event(&event);
                if let Some(entry) = panel.entry(device) {
                    print_entry(entry);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Waits for the relay result of the command dispatched for `device`.
async fn await_outcome(
    events: &mut broadcast::Receiver<ClientEvent>,
    device: DeviceKey,
) -> Result<()> {
    let mut dispatched = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("client session closed"),
        };
        match event {
            ClientEvent::Dispatched { command } if command.device == device => {
                dispatched += 1;
                println!("dispatched {} ({})", command.requested_state, command.command_id);
            }
            ClientEvent::Relayed { command, response } if command.device == device => {
                match response {
                    RelayResponse::Success {
                        tx_ref,
                        confirmed_state,
                        block_ordinal,
                    } => println!(
                        "{device} confirmed {confirmed_state} \
                         in block {block_ordinal} (tx {tx_ref})"
                    ),
                    RelayResponse::Queued { queued_state } => println!(
                        "{device} busy; {queued_state} queued \
                         behind the in-flight transaction"
                    ),
                }
                println!("{dispatched} command(s) relayed");
                return Ok(());
            }
            ClientEvent::RelayFailed { command, error } if command.device == device => {
                bail!("{device}: {:?}: {}", error.error, error.detail);
            }
            _ => {}
        }
    }
}

fn print_entry(entry: &PanelEntry) {
    let render = |state: Option<shared::domain::DeviceState>| {
        state
            .map(|state| state.to_string())
            .unwrap_or_else(|| "unset".to_string())
    };
    let error = entry
        .last_error
        .as_ref()
        .map(|error| format!(" last_error={:?}", error.error))
        .unwrap_or_default();
    println!(
        "{:<10} shown={:<8} confirmed={:<8} {:?}{}",
        entry.device.to_string(),
        render(entry.shown),
        render(entry.confirmed),
        entry.status,
        error
    );
}
