use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use covhub_control::{AgentProfileQuery, ControlError, IdFilter, RegistryError};
use covhub_cover::CoverError;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::*;
use crate::AppState;

pub type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Map a control plane error to a status code and error body
pub fn control_error(err: ControlError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        ControlError::Registry(RegistryError::UnknownAgent(_)) => {
            (StatusCode::BAD_REQUEST, "AGENT_NOT_FOUND")
        }
        ControlError::Registry(RegistryError::Duplicate(_))
        | ControlError::Registry(RegistryError::WatchAttached(_)) => {
            (StatusCode::CONFLICT, "CONFLICT")
        }
        ControlError::InvalidPattern { .. } => (StatusCode::BAD_REQUEST, "INVALID_PATTERN"),
        ControlError::InvalidAddress { .. } => (StatusCode::BAD_REQUEST, "INVALID_ADDRESS"),
        ControlError::AmbiguousSelector => (StatusCode::BAD_REQUEST, "AMBIGUOUS_SELECTOR"),
        ControlError::UnknownService(_) | ControlError::UnknownAddress(_) => {
            (StatusCode::BAD_REQUEST, "SERVICE_NOT_FOUND")
        }
        ControlError::Cover(CoverError::NoProfiles) | ControlError::Cover(CoverError::EmptyProfile) => {
            (StatusCode::NOT_FOUND, "NO_PROFILES")
        }
        ControlError::Cover(_) => (StatusCode::UNPROCESSABLE_ENTITY, "MERGE_FAILED"),
        ControlError::ProfileFetch { .. } | ControlError::Clear { .. } => {
            (StatusCode::BAD_GATEWAY, "AGENT_UNAVAILABLE")
        }
        ControlError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_FAILED"),
    };

    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    } else {
        debug!(error = %err, "Request rejected");
    }
    (status, Json(ErrorResponse::new(err.to_string(), code)))
}

/// List registered agents
#[utoipa::path(
    get,
    path = "/v2/agents",
    params(AgentsQuery),
    responses(
        (status = 200, description = "Registered agents", body = AgentList)
    ),
    tag = "agents"
)]
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> Json<AgentList> {
    let items = state
        .control
        .list_agents(&IdFilter::parse(&query.id))
        .into_iter()
        .map(|info| Agent::from_info(info, query.wide))
        .collect();
    Json(AgentList { items })
}

/// Disconnect agents
#[utoipa::path(
    delete,
    path = "/v2/agents",
    params(AgentsQuery),
    responses(
        (status = 200, description = "Agents removed", body = DeleteAgentsResponse)
    ),
    tag = "agents"
)]
pub async fn delete_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> Json<DeleteAgentsResponse> {
    let removed = state.control.delete_agents(&IdFilter::parse(&query.id));
    Json(DeleteAgentsResponse { removed })
}

/// Merged coverage profile of the selected agents
#[utoipa::path(
    get,
    path = "/v2/cover/profile",
    params(ProfileQuery),
    responses(
        (status = 200, description = "Merged profile", body = ProfileResponse),
        (status = 400, description = "Invalid selection", body = ErrorResponse),
        (status = 404, description = "Nothing to merge", body = ErrorResponse),
        (status = 422, description = "Profiles cannot be merged", body = ErrorResponse),
        (status = 502, description = "An agent failed to answer", body = ErrorResponse)
    ),
    tag = "cover"
)]
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfileQuery>,
) -> ApiResult<Json<ProfileResponse>> {
    let query = AgentProfileQuery {
        ids: IdFilter::parse(&query.id),
        skip_patterns: split_list(&query.skippattern),
        extra: query.extra,
        force: query.force,
    };

    let profile = state
        .control
        .fetch_agent_profile(&query)
        .await
        .map_err(control_error)?;
    Ok(Json(ProfileResponse { profile }))
}

/// Reset the counters of the selected agents
#[utoipa::path(
    delete,
    path = "/v2/cover/profile",
    params(ClearQuery),
    responses(
        (status = 200, description = "Counters cleared", body = ClearResponse),
        (status = 400, description = "Invalid selection", body = ErrorResponse)
    ),
    tag = "cover"
)]
pub async fn clear_profile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearQuery>,
) -> ApiResult<Json<ClearResponse>> {
    let report = state
        .control
        .clear_agent_counters(&IdFilter::parse(&query.id), &query.extra)
        .await
        .map_err(control_error)?;

    Ok(Json(ClearResponse {
        cleared: report.cleared,
        failed: report
            .failed
            .into_iter()
            .map(|(id, error)| ClearFailure { id, error })
            .collect(),
    }))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, body) = control_error(ControlError::Registry(RegistryError::UnknownAgent(
            "abc".to_string(),
        )));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code.as_deref(), Some("AGENT_NOT_FOUND"));

        let (status, _) = control_error(ControlError::Cover(CoverError::NoProfiles));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = control_error(ControlError::ProfileFetch {
            source_name: "abc".to_string(),
            reason: "Connection closed".to_string(),
        });
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.error.contains("abc"));
    }
}
