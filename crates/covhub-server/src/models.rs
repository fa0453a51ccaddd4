use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use covhub_control::{AgentInfo, ProfileParam};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Registered agent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Agent {
    /// Fingerprint of the agent process
    pub id: String,
    pub hostname: String,
    pub pid: String,
    /// One of `disconnected`, `tunnel_only`, `watch_only`, `both`
    pub status: String,
    pub connected_at: DateTime<Utc>,
    /// Only listed with `wide=true`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl Agent {
    pub fn from_info(info: AgentInfo, wide: bool) -> Self {
        Self {
            status: info.status.to_string(),
            remote_ip: wide.then_some(info.remote_ip),
            cmdline: wide.then_some(info.cmdline),
            extra: wide.then_some(info.extra),
            id: info.id,
            hostname: info.hostname,
            pid: info.pid,
            connected_at: info.connected_at,
        }
    }
}

/// List of agents
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentList {
    pub items: Vec<Agent>,
}

/// Agents removed by a delete request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteAgentsResponse {
    pub removed: Vec<String>,
}

/// Merged coverage profile
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProfileResponse {
    /// Profile text, starting with the `mode:` line
    pub profile: String,
}

/// Agent that could not be cleared
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClearFailure {
    pub id: String,
    pub error: String,
}

/// Result of clearing agent counters
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClearResponse {
    pub cleared: Vec<String>,
    pub failed: Vec<ClearFailure>,
}

/// Result of a legacy mutation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LegacyResult {
    pub result: String,
}

impl LegacyResult {
    pub fn success() -> Self {
        Self {
            result: "success".to_string(),
        }
    }
}

/// Registered services, name to addresses
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ServiceMap(pub BTreeMap<String, Vec<String>>);

/// Service selection of the legacy profile, clear and remove requests
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ProfileRequest {
    /// Skip unknown and unreachable services
    pub force: bool,
    /// Service names; cannot be combined with `address`
    pub service: Vec<String>,
    /// Service addresses; cannot be combined with `service`
    pub address: Vec<String>,
    /// Regexes of files to keep
    pub coverfile: Vec<String>,
    /// Regexes of files to drop
    pub skipfile: Vec<String>,
}

impl From<ProfileRequest> for ProfileParam {
    fn from(req: ProfileRequest) -> Self {
        ProfileParam {
            force: req.force,
            service: req.service,
            address: req.address,
            coverfile: req.coverfile,
            skipfile: req.skipfile,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

/// Agent selection
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(default)]
pub struct AgentsQuery {
    /// Comma separated agent ids; empty selects every agent
    pub id: String,
    /// Include remote address, command line and tag
    pub wide: bool,
}

/// Merged agent profile selection
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(default)]
pub struct ProfileQuery {
    /// Comma separated agent ids; empty selects every agent
    pub id: String,
    /// Comma separated substrings; matching files are left out
    pub skippattern: String,
    /// Regex on the agents' extra tag
    pub extra: String,
    /// Skip unknown and failing agents
    pub force: bool,
}

/// Agent counter reset selection
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(default)]
pub struct ClearQuery {
    /// Comma separated agent ids; empty selects every agent
    pub id: String,
    /// Regex on the agents' extra tag
    pub extra: String,
}

/// Legacy service registration
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(default)]
pub struct RegisterQuery {
    pub name: String,
    /// `http` or `https` URL of the service
    pub address: String,
}
