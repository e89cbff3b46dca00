use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde_json::Value;
use shared::{
    domain::{Command, DeviceKey, RequestedState},
    error::{ApiError, ErrorKind},
    protocol::{
        events_route, relay_route, state_route, RelayEvent, RelayRequest, RelayResponse,
        StateResponse,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::{error::ClientError, CommandSink};

/// Relay calls block until the ledger confirms, so the request timeout sits
/// well above the server's confirmation timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct RelayHttpClient {
    http: Client,
    server_url: Url,
}

impl RelayHttpClient {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        let server_url =
            Url::parse(server_url).map_err(|_| ClientError::InvalidUrl(server_url.to_string()))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(server_url.to_string()));
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| ClientError::Transport(error.to_string()))?;
        Ok(Self { http, server_url })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}{}", self.server_url.as_str().trim_end_matches('/'), route)
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        let response = self.http.get(self.endpoint("/healthz")).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_body(response).await)
        }
    }

    pub async fn relay(
        &self,
        device: DeviceKey,
        desired_state: RequestedState,
    ) -> Result<RelayResponse, ClientError> {
        let request = RelayRequest {
            device_class: device.device_class,
            device_id: device.device_id,
            desired_state,
        };
        debug!(%device, "sending relay request");
        let response = self
            .http
            .post(self.endpoint(relay_route()))
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn state(&self, refresh: bool) -> Result<StateResponse, ClientError> {
        let response = self
            .http
            .get(self.endpoint(state_route()))
            .query(&[("refresh", refresh)])
            .send()
            .await?;
        decode(response).await
    }

    fn events_url(&self) -> Result<Url, ClientError> {
        let mut url = self.server_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidUrl(self.server_url.to_string()))?;
        url.set_path(events_route());
        url.set_query(None);
        Ok(url)
    }

    /// Opens the server's event stream. Events arrive in server order; the
    /// subscription ends when the socket closes.
    pub async fn subscribe_events(&self) -> Result<EventSubscription, ClientError> {
        let url = self.events_url()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|error| ClientError::Transport(format!("{url}: {error}")))?;
        let (_, mut reader) = socket.split();
        let (tx, events) = mpsc::channel(EVENT_BUFFER);

        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => warn!(%error, "ignoring malformed relay event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "relay event stream failed");
                        break;
                    }
                }
            }
            debug!("relay event stream closed");
        });

        Ok(EventSubscription {
            events,
            reader_task,
        })
    }
}

#[async_trait]
impl CommandSink for RelayHttpClient {
    async fn relay(&self, command: &Command) -> Result<RelayResponse, ClientError> {
        RelayHttpClient::relay(self, command.device, command.requested_state.into()).await
    }
}

pub struct EventSubscription {
    events: mpsc::Receiver<RelayEvent>,
    reader_task: JoinHandle<()>,
}

impl EventSubscription {
    /// `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    if response.status().is_success() {
        Ok(response.json::<T>().await?)
    } else {
        Err(error_from_body(response).await)
    }
}

async fn error_from_body(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(error) => return error.into(),
    };
    let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        // Errors raised before our handlers run (body limits, routing) are
        // plain text or foreign JSON.
        let detail = match serde_json::from_str::<Value>(&body) {
            Ok(value) => value.to_string(),
            Err(_) => body.trim().to_string(),
        };
        ApiError::new(kind_for_status(status), detail)
    });
    ClientError::Api { status, error }
}

fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 | 422 => ErrorKind::InvalidState,
        404 => ErrorKind::UnknownDevice,
        502 => ErrorKind::SubmissionError,
        503 => ErrorKind::TransportError,
        504 => ErrorKind::Timeout,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
