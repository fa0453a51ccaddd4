//! Protocol message types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote procedures an agent serves over its tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    /// Dump the agent's current counters as profile text
    GetProfile,
    /// Zero the agent's counters
    ResetProfile,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::GetProfile => "Agent.GetProfile",
            RpcMethod::ResetProfile => "Agent.ResetProfile",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Agent.GetProfile" => Some(RpcMethod::GetProfile),
            "Agent.ResetProfile" => Some(RpcMethod::ResetProfile),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-RPC request sent from the registry to an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, id: u64) -> Self {
        Self {
            method: method.as_str().to_string(),
            params: serde_json::Value::Array(Vec::new()),
            id,
        }
    }
}

/// JSON-RPC response sent back by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Handshake errors, reported before the socket is upgraded
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing some params: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

/// Identifying metadata an agent supplies when it dials the tunnel endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetadata {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub pid: String,
    #[serde(default)]
    pub cmdline: String,
    /// Free-form tag, e.g. the namespace of otherwise identical pods
    #[serde(default)]
    pub extra: String,
}

impl AgentMetadata {
    /// Check that every identifying field is present
    pub fn validate(&self) -> Result<(), HandshakeError> {
        let mut missing = Vec::new();
        if self.hostname.trim().is_empty() {
            missing.push("hostname");
        }
        if self.pid.trim().is_empty() {
            missing.push("pid");
        }
        if self.cmdline.trim().is_empty() {
            missing.push("cmdline");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(HandshakeError::MissingFields(missing))
        }
    }
}

/// Query parameters of the agent watch push endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchPushParams {
    #[serde(default)]
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(RpcMethod::GetProfile.as_str(), "Agent.GetProfile");
        assert_eq!(
            RpcMethod::parse("Agent.ResetProfile"),
            Some(RpcMethod::ResetProfile)
        );
        assert_eq!(RpcMethod::parse("Agent.Unknown"), None);
    }

    #[test]
    fn test_request_wire_shape() {
        let req = RpcRequest::new(RpcMethod::GetProfile, 7);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"method":"Agent.GetProfile","params":[],"id":7}"#);
    }

    #[test]
    fn test_response_accepts_null_error() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"id":3,"result":"mode: set\n","error":null}"#).unwrap();
        assert_eq!(resp.id, 3);
        assert_eq!(resp.error, None);
        assert_eq!(resp.result, serde_json::json!("mode: set\n"));
    }

    #[test]
    fn test_metadata_validation_names_missing_fields() {
        let meta = AgentMetadata {
            hostname: "host-a".to_string(),
            pid: " ".to_string(),
            cmdline: String::new(),
            extra: String::new(),
        };

        let err = meta.validate().unwrap_err();
        assert_eq!(err, HandshakeError::MissingFields(vec!["pid", "cmdline"]));
        assert!(err.to_string().contains("pid, cmdline"));
    }

    #[test]
    fn test_metadata_validation_ok() {
        let meta = AgentMetadata {
            hostname: "host-a".to_string(),
            pid: "42".to_string(),
            cmdline: "./server --port 8080".to_string(),
            extra: String::new(),
        };
        assert!(meta.validate().is_ok());
    }
}
