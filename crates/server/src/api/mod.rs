use relay::{Reconciler, RelayService};
use serde_json::Value;
use shared::{
    domain::DeviceClass,
    error::{ApiError, ErrorKind},
    protocol::{RelayRequest, RelayResponse, StateResponse},
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiContext {
    pub relay: RelayService,
    pub reconciler: Reconciler,
}

/// Parses a relay body. An unrecognised device class is reported as an
/// unknown device; every other shape problem is an invalid state.
pub fn parse_relay_request(body: &[u8]) -> Result<RelayRequest, ApiError> {
    serde_json::from_slice::<RelayRequest>(body).map_err(|error| {
        let class = serde_json::from_slice::<Value>(body).ok().and_then(|value| {
            value
                .get("deviceClass")
                .or_else(|| value.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        match class.map(|class| class.parse::<DeviceClass>()) {
            Some(Err(unknown)) => ApiError::from(unknown),
            _ => ApiError::new(
                ErrorKind::InvalidState,
                format!("malformed relay request: {error}"),
            ),
        }
    })
}

pub async fn relay_intent(
    ctx: &ApiContext,
    request: RelayRequest,
) -> Result<RelayResponse, ApiError> {
    let device = request.device();
    match ctx.relay.relay(device, request.desired_state).await {
        Ok(outcome) => {
            let response = RelayResponse::from(outcome);
            info!(%device, ?response, "relay request answered");
            Ok(response)
        }
        Err(error) => {
            warn!(%device, kind = ?error.kind(), %error, "relay request failed");
            Err(ApiError::from(error))
        }
    }
}

pub async fn device_states(ctx: &ApiContext, refresh: bool) -> StateResponse {
    if refresh {
        ctx.reconciler.reconcile_once().await;
    }
    StateResponse {
        devices: ctx.relay.state_summaries(),
    }
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
