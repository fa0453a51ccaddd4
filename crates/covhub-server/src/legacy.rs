//! Legacy `/v1` API for services registered by address
//!
//! Failures answer `417 Expectation Failed`, store failures `500`, as older
//! clients expect.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use covhub_control::{ControlError, ProfileParam};
use tracing::{debug, warn};

use crate::models::*;
use crate::AppState;

type LegacyResponse<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

fn legacy_error(err: ControlError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ControlError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::EXPECTATION_FAILED,
    };
    if status.is_server_error() {
        warn!(error = %err, "Legacy request failed");
    } else {
        debug!(error = %err, "Legacy request rejected");
    }
    (status, Json(ErrorResponse::new(err.to_string(), "LEGACY_REQUEST_FAILED")))
}

/// Parse a JSON request body; an empty body selects the defaults
fn parse_param(body: &[u8]) -> LegacyResponse<ProfileParam> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ProfileParam::default());
    }
    serde_json::from_slice::<ProfileRequest>(body)
        .map(ProfileParam::from)
        .map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(e.to_string(), "INVALID_BODY")),
            )
        })
}

/// Register a service address
#[utoipa::path(
    post,
    path = "/v1/cover/register",
    params(RegisterQuery),
    responses(
        (status = 200, description = "Service registered", body = LegacyResult),
        (status = 400, description = "Missing name or address", body = ErrorResponse),
        (status = 417, description = "Invalid address", body = ErrorResponse)
    ),
    tag = "legacy"
)]
pub async fn register_service(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RegisterQuery>,
) -> LegacyResponse<Json<LegacyResult>> {
    if query.name.trim().is_empty() || query.address.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "missing some params: name, address",
                "MISSING_PARAMS",
            )),
        ));
    }

    state
        .control
        .register_service(query.name.trim(), &query.address)
        .map_err(legacy_error)?;
    Ok(Json(LegacyResult::success()))
}

/// All registered services
#[utoipa::path(
    get,
    path = "/v1/cover/list",
    responses((status = 200, description = "Service name to addresses", body = ServiceMap)),
    tag = "legacy"
)]
pub async fn list_services(State(state): State<Arc<AppState>>) -> Json<ServiceMap> {
    Json(ServiceMap(state.control.list_services()))
}

/// Forget every registered service
#[utoipa::path(
    post,
    path = "/v1/cover/init",
    responses(
        (status = 200, description = "Store cleared", body = LegacyResult),
        (status = 500, description = "Store failure", body = ErrorResponse)
    ),
    tag = "legacy"
)]
pub async fn init_services(
    State(state): State<Arc<AppState>>,
) -> LegacyResponse<Json<LegacyResult>> {
    state.control.init_services().map_err(legacy_error)?;
    Ok(Json(LegacyResult::success()))
}

/// Merged profile of the selected services
#[utoipa::path(
    post,
    path = "/v1/cover/profile",
    request_body = ProfileRequest,
    responses(
        (status = 200, description = "Merged profile text", body = String, content_type = "text/plain"),
        (status = 417, description = "Selection or fetch failed", body = ErrorResponse)
    ),
    tag = "legacy"
)]
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> LegacyResponse<String> {
    let param = parse_param(&body)?;
    state
        .control
        .fetch_service_profile(&param)
        .await
        .map_err(legacy_error)
}

/// Clear the counters of the selected services
#[utoipa::path(
    post,
    path = "/v1/cover/clear",
    request_body = ProfileRequest,
    responses(
        (status = 200, description = "One line per cleared service", body = String, content_type = "text/plain"),
        (status = 417, description = "Selection or clear failed", body = ErrorResponse)
    ),
    tag = "legacy"
)]
pub async fn clear_services(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> LegacyResponse<String> {
    let param = parse_param(&body)?;
    state
        .control
        .clear_services(&param)
        .await
        .map_err(legacy_error)
}

/// Remove the selected services from the store
#[utoipa::path(
    post,
    path = "/v1/cover/remove",
    request_body = ProfileRequest,
    responses(
        (status = 200, description = "One line per removed service", body = String, content_type = "text/plain"),
        (status = 417, description = "Selection failed", body = ErrorResponse)
    ),
    tag = "legacy"
)]
pub async fn remove_services(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> LegacyResponse<String> {
    let param = parse_param(&body)?;
    state.control.remove_services(&param).map_err(legacy_error)
}
