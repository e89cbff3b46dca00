//! Client side of the relay: debounces user intents per device, dispatches
//! the settled commands to the relay server without blocking the caller and
//! streams the server's events back for display.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{Command, DeviceKey, DeviceState, RequestedState},
    error::ApiError,
    protocol::{RelayEvent, RelayResponse},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};

mod debouncer;
pub mod error;
mod http;
mod panel;

pub use debouncer::{Debouncer, DEFAULT_QUIESCENCE};
pub use error::ClientError;
pub use http::{EventSubscription, RelayHttpClient};
pub use panel::{ControlPanel, PanelEntry, PanelStatus};

const CLIENT_EVENT_CAPACITY: usize = 1024;

/// Where settled commands go.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn relay(&self, command: &Command) -> Result<RelayResponse, ClientError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A settled command left the debouncer and is on its way to the server.
    Dispatched { command: Command },
    Relayed {
        command: Command,
        response: RelayResponse,
    },
    RelayFailed { command: Command, error: ApiError },
    Relay(RelayEvent),
}

/// Debouncer plus dispatcher. Callers hand in intents and observe outcomes
/// through [`ClientSession::subscribe`]; nothing here waits on the ledger.
pub struct ClientSession {
    debouncer: Debouncer,
    events: broadcast::Sender<ClientEvent>,
    dispatcher: JoinHandle<()>,
}

impl ClientSession {
    pub fn new(sink: Arc<dyn CommandSink>, quiescence: Duration) -> Self {
        let (debouncer, commands) = Debouncer::new(quiescence);
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        let dispatcher = spawn_dispatcher(commands, sink, events.clone());
        info!(quiescence_ms = quiescence.as_millis() as u64, "client session started");
        Self {
            debouncer,
            events,
            dispatcher,
        }
    }

    /// Validates locally and buffers the intent. Range errors never leave the
    /// client.
    pub fn submit_intent(
        &self,
        device: DeviceKey,
        requested: RequestedState,
    ) -> Result<DeviceState, ClientError> {
        let desired = requested.validate()?;
        self.debouncer.submit_intent(device, desired);
        Ok(desired)
    }

    pub fn pending(&self, device: DeviceKey) -> Option<DeviceState> {
        self.debouncer.pending(device)
    }

    pub fn flush(&self) -> usize {
        self.debouncer.flush()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Republishes server events on this session's channel until the
    /// subscription ends.
    pub fn forward_relay_events(&self, mut subscription: EventSubscription) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let _ = events.send(ClientEvent::Relay(event));
            }
        })
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Each command gets its own task so a device waiting on confirmation never
/// delays another device's command.
fn spawn_dispatcher(
    mut commands: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn CommandSink>,
    events: broadcast::Sender<ClientEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let _ = events.send(ClientEvent::Dispatched {
                command: command.clone(),
            });
            let sink = Arc::clone(&sink);
            let events = events.clone();
            tokio::spawn(async move {
                match sink.relay(&command).await {
                    Ok(response) => {
                        let _ = events.send(ClientEvent::Relayed { command, response });
                    }
                    Err(error) => {
                        warn!(device = %command.device, %error, "relay request failed");
                        let _ = events.send(ClientEvent::RelayFailed {
                            command,
                            error: error.to_api_error(),
                        });
                    }
                }
            });
        }
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
