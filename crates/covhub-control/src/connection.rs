//! Handles to whatever serves coverage profiles

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use covhub_proto::RpcMethod;
use covhub_transport::{RpcClient, TransportError, TransportResult};
use serde_json::Value;

use crate::signal::ExitSignal;

/// Something the registry can pull a profile from or clear counters on
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Name used in logs and error messages
    fn label(&self) -> String;

    /// Current counters as profile text
    async fn fetch_profile(&self) -> TransportResult<String>;

    /// Zero the counters, returning the source's acknowledgement
    async fn clear_profile(&self) -> TransportResult<String>;
}

/// RPC connection over an agent's tunnel
///
/// Closing the connection fires the tunnel's exit signal; the tunnel task
/// then tears the socket down and releases the registry slot.
#[derive(Debug)]
pub struct AgentConnection {
    agent_id: String,
    client: RpcClient,
    exit: Arc<ExitSignal>,
    rpc_timeout: Duration,
}

impl AgentConnection {
    pub fn new(
        agent_id: impl Into<String>,
        client: RpcClient,
        exit: Arc<ExitSignal>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            client,
            exit,
            rpc_timeout,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Ask the agent for its profile
    pub async fn get_profile(&self) -> TransportResult<String> {
        match self
            .client
            .call(RpcMethod::GetProfile, self.rpc_timeout)
            .await?
        {
            Value::String(profile) => Ok(profile),
            other => Err(TransportError::ProtocolError(format!(
                "expected profile text from {}, got {}",
                self.agent_id, other
            ))),
        }
    }

    /// Ask the agent to zero its counters
    pub async fn reset_profile(&self) -> TransportResult<()> {
        self.client
            .call(RpcMethod::ResetProfile, self.rpc_timeout)
            .await?;
        Ok(())
    }

    /// Close the tunnel; returns `true` only for the first close
    pub fn close(&self) -> bool {
        let fired = self.exit.fire();
        if fired {
            tracing::info!(agent_id = %self.agent_id, "Closing agent tunnel");
        }
        fired
    }

    pub fn exit_signal(&self) -> &Arc<ExitSignal> {
        &self.exit
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.client
    }
}

#[async_trait]
impl ProfileSource for AgentConnection {
    fn label(&self) -> String {
        format!("agent {}", self.agent_id)
    }

    async fn fetch_profile(&self) -> TransportResult<String> {
        self.get_profile().await
    }

    async fn clear_profile(&self) -> TransportResult<String> {
        self.reset_profile().await?;
        Ok("cleared".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covhub_transport::{serve_rpc, RpcHandler};

    struct NumberAgent;

    #[async_trait]
    impl RpcHandler for NumberAgent {
        async fn handle(&self, method: RpcMethod) -> Result<Value, String> {
            match method {
                RpcMethod::GetProfile => Ok(Value::from(42)),
                RpcMethod::ResetProfile => Ok(Value::Null),
            }
        }
    }

    fn connect(exit: Arc<ExitSignal>) -> AgentConnection {
        let (client_io, agent_io) = tokio::io::duplex(4096);
        tokio::spawn(serve_rpc(agent_io, NumberAgent));
        AgentConnection::new(
            "abc123",
            RpcClient::new(client_io),
            exit,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_non_text_profile_is_protocol_error() {
        let conn = connect(Arc::new(ExitSignal::new()));
        let err = conn.get_profile().await.unwrap_err();
        assert!(matches!(err, TransportError::ProtocolError(_)));
        assert!(conn.reset_profile().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fires_exit_once() {
        let exit = Arc::new(ExitSignal::new());
        let conn = connect(exit.clone());

        assert!(conn.close());
        assert!(!conn.close());
        assert!(exit.is_fired());
        assert_eq!(conn.label(), "agent abc123");
    }
}
