//! Control-plane endpoints: manual release and risk read APIs.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use aigw_common::CredentialId;
use aigw_core::GatewayError;
use aigw_risk::{EventFilter, LifecycleState, ManualReleaseError, ManualReleaseRequest, SignalType};

use crate::proxy::{GatewayState, error_response, json_response};

#[derive(Debug, Deserialize)]
pub(crate) struct ReleaseBody {
    credential_id: String,
    target_state: LifecycleState,
    reason: String,
    confirm_credential_id: String,
    #[serde(default)]
    force: bool,
}

pub(crate) async fn manual_release(
    State(state): State<GatewayState>,
    axum::Json(body): axum::Json<ReleaseBody>,
) -> Response {
    let Some(credential) = CredentialId::parse(&body.credential_id) else {
        return error_response(&GatewayError::bad_request("malformed credential id"));
    };
    let request = ManualReleaseRequest {
        credential,
        target_state: body.target_state,
        reason: body.reason,
        confirm_credential_id: body.confirm_credential_id,
        force: body.force,
    };
    match state.dispatcher.manual_release(&request).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"released": true})),
        Err(err @ ManualReleaseError::UnknownCredential) => {
            error_response(&GatewayError::bad_request(err.to_string()))
        }
        Err(err) => error_response(&GatewayError::forbidden(err.to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CredentialsQuery {
    provider_type: Option<String>,
    lifecycle_state: Option<LifecycleState>,
}

pub(crate) async fn risk_credentials(
    State(state): State<GatewayState>,
    Query(query): Query<CredentialsQuery>,
) -> Response {
    let filter = aigw_risk::RecordFilter {
        provider_type: query.provider_type,
        lifecycle_state: query.lifecycle_state,
    };
    let records = state
        .dispatcher
        .risk()
        .store()
        .get_all_credentials(&filter)
        .await;
    match serde_json::to_value(&records) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => error_response(&GatewayError::internal(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PolicyBody {
    mode: Option<aigw_common::RiskMode>,
    identity_window_ms: Option<u64>,
}

pub(crate) async fn update_policy(
    State(state): State<GatewayState>,
    axum::Json(body): axum::Json<PolicyBody>,
) -> Response {
    state
        .dispatcher
        .risk()
        .update_policy_config(
            body.mode,
            body.identity_window_ms
                .map(std::time::Duration::from_millis),
        )
        .await;
    let mode = state.dispatcher.risk().mode().await;
    json_response(StatusCode::OK, &serde_json::json!({ "mode": mode }))
}

pub(crate) async fn risk_summary(State(state): State<GatewayState>) -> Response {
    let summary = state.dispatcher.risk().store().get_summary().await;
    match serde_json::to_value(&summary) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => error_response(&GatewayError::internal(err.to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventsQuery {
    credential_id: Option<String>,
    provider_type: Option<String>,
    signal_type: Option<SignalType>,
    limit: Option<usize>,
}

pub(crate) async fn risk_events(
    State(state): State<GatewayState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let filter = EventFilter {
        credential_id: query.credential_id,
        provider_type: query.provider_type,
        signal_type: query.signal_type,
        limit: query.limit,
    };
    let events = state
        .dispatcher
        .risk()
        .store()
        .get_recent_events(&filter)
        .await;
    match serde_json::to_value(&events) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => error_response(&GatewayError::internal(err.to_string())),
    }
}
