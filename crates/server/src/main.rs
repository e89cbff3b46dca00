use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use relay::{Reconciler, RelayService};
use shared::{
    error::{ApiError, ErrorKind},
    protocol::{
        events_route, relay_route, state_route, RelayEvent, RelayResponse, StateQuery,
        StateResponse,
    },
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod ledger;

use api::{device_states, parse_relay_request, relay_intent, ApiContext};
use app_state::AppState;
use config::load_settings;
use ledger::connect_ledger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let ledger = connect_ledger(&settings).await?;

    let relay = RelayService::start(settings.relay_config(), Arc::clone(&ledger.client));
    let reconciler = Reconciler::new(relay.clone(), settings.reconcile_interval());
    let initial = reconciler.reconcile_once().await;
    info!(
        applied = initial.applied,
        failed = initial.failed,
        "initial ledger reconciliation finished"
    );
    let reconcile_task = reconciler.clone().spawn();

    let state = AppState {
        api: ApiContext { relay, reconciler },
        max_body_bytes: settings.max_body_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid server_bind '{}'", settings.server_bind))?;
    info!(%addr, "relay server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconcile_task.abort();
    ledger.shutdown();
    info!("relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route(relay_route(), post(http_relay))
        .route(state_route(), get(http_state))
        .route(events_route(), get(ws_handler))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidState => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownDevice => StatusCode::NOT_FOUND,
        ErrorKind::SubmissionError | ErrorKind::ConfirmationError => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::TransportError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (error_status(error.error), Json(error))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_relay(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RelayResponse>, (StatusCode, Json<ApiError>)> {
    let request = parse_relay_request(&body).map_err(error_response)?;
    let response = relay_intent(&state.api, request)
        .await
        .map_err(error_response)?;
    Ok(Json(response))
}

async fn http_state(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StateQuery>,
) -> Json<StateResponse> {
    Json(device_states(&state.api, q.refresh).await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.api.relay.subscribe());

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping events");
                    continue;
                }
            };
            let text = match encode_event(&event) {
                Ok(text) => text,
                Err(error) => {
                    warn!(%error, device = %event.device(), "failed to encode relay event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}
    debug!("event subscriber disconnected");

    send_task.abort();
}

fn encode_event(event: &RelayEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
