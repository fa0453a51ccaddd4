//! Agent tunnel endpoint
//!
//! An instrumented service dials in once, is registered under its
//! fingerprint, and from then on answers RPC calls over the socket until one
//! side gives up.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use covhub_control::{AgentConnection, RegistryError, TunnelClaim};
use covhub_proto::AgentMetadata;
use covhub_transport::{MessageStream, RpcClient};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::models::ErrorResponse;
use crate::socket::SocketTasks;
use crate::AppState;

/// RPC frames buffered in each direction of a tunnel
const PIPE_CAPACITY: usize = 64;

/// Lifecycle of one tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Handshake received, metadata not yet checked
    Connecting,
    /// Registry slot claimed, socket not yet upgraded
    Registered,
    /// RPC client running over the socket
    Active,
    /// Exit signal fired, socket being torn down
    Closing,
    /// Registry slot released
    Closed,
}

impl TunnelState {
    /// Whether `next` may follow `self`
    pub fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Connecting, Registered)
                | (Connecting, Closed)
                | (Registered, Active)
                | (Registered, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Tracks the state of one tunnel for logging
struct Lifecycle {
    agent_id: String,
    state: TunnelState,
}

impl Lifecycle {
    fn advance(&mut self, next: TunnelState) {
        if !self.state.can_advance_to(next) {
            warn!(agent_id = %self.agent_id, from = ?self.state, to = ?next, "Unexpected tunnel transition");
        }
        debug!(agent_id = %self.agent_id, from = ?self.state, to = ?next, "Tunnel state changed");
        self.state = next;
    }
}

/// Agent tunnel upgrade
#[utoipa::path(
    get,
    path = "/v2/internal/ws/rpcstream",
    params(
        ("hostname" = String, Query, description = "Host the agent runs on"),
        ("pid" = String, Query, description = "Agent process id"),
        ("cmdline" = String, Query, description = "Agent command line"),
        ("extra" = Option<String>, Query, description = "Free-form agent tag")
    ),
    responses(
        (status = 101, description = "Switching to the RPC tunnel"),
        (status = 400, description = "Missing handshake fields", body = ErrorResponse),
        (status = 409, description = "Agent already has a tunnel", body = ErrorResponse)
    ),
    tag = "internal"
)]
pub async fn tunnel_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(metadata): Query<AgentMetadata>,
    ws: WebSocketUpgrade,
) -> Response {
    let mut lifecycle = Lifecycle {
        agent_id: String::new(),
        state: TunnelState::Connecting,
    };

    if let Err(e) = metadata.validate() {
        warn!(remote = %remote, error = %e, "Rejected tunnel handshake");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(e.to_string(), "MISSING_PARAMS")),
        )
            .into_response();
    }

    let claim = match state
        .registry
        .claim_tunnel(&metadata, &remote.ip().to_string())
    {
        Ok(claim) => claim,
        Err(e @ RegistryError::Duplicate(_)) => {
            return (
                StatusCode::CONFLICT,
                Json(ErrorResponse::new(e.to_string(), "DUPLICATE_AGENT")),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(e.to_string(), "REGISTRATION_FAILED")),
            )
                .into_response();
        }
    };
    lifecycle.agent_id = claim.agent_id.clone();
    lifecycle.advance(TunnelState::Registered);

    let failed = (state.clone(), claim.clone());
    ws.on_failed_upgrade(move |e| {
        let (state, claim) = failed;
        warn!(agent_id = %claim.agent_id, error = %e, "Tunnel upgrade failed");
        state.registry.release_tunnel(&claim.agent_id, claim.session);
    })
    .on_upgrade(move |socket| run_tunnel(state, claim, lifecycle, socket))
}

async fn run_tunnel(
    state: Arc<AppState>,
    claim: TunnelClaim,
    mut lifecycle: Lifecycle,
    socket: WebSocket,
) {
    let agent_id = claim.agent_id.clone();
    let exit = claim.exit.clone();
    let (sink, mut stream) = socket.split();
    let tasks = SocketTasks::start(
        &state,
        format!("tunnel:{}:{}", agent_id, claim.session),
        sink,
        exit.clone(),
    );

    let (rpc_io, pipe) = MessageStream::pair(PIPE_CAPACITY);
    let inbound = pipe.inbound;
    let mut rpc_frames = pipe.outbound;
    let connection = Arc::new(AgentConnection::new(
        agent_id.clone(),
        RpcClient::new(rpc_io),
        exit.clone(),
        state.config.rpc_timeout,
    ));
    if !state
        .registry
        .activate_tunnel(&agent_id, claim.session, connection)
    {
        // Deleted between the claim and the upgrade.
        exit.fire();
    }
    lifecycle.advance(TunnelState::Active);
    info!(agent_id = %agent_id, "Agent tunnel active");

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            frame = rpc_frames.recv() => {
                let Some(frame) = frame else { break };
                let text = String::from_utf8_lossy(&frame).into_owned();
                if tasks.outbound().send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let bytes = Bytes::copy_from_slice(text.as_str().as_bytes());
                    if inbound.send(bytes).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if inbound.send(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => tasks.liveness().touch(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!(agent_id = %agent_id, "Agent closed the tunnel");
                    break;
                }
                Some(Err(e)) => {
                    warn!(agent_id = %agent_id, error = %e, "Tunnel read failed");
                    break;
                }
            }
        }
    }

    lifecycle.advance(TunnelState::Closing);
    exit.fire();
    // In-flight calls fail once the RPC reader sees the end of the stream.
    drop(inbound);
    tasks.close(&state).await;

    if state.registry.release_tunnel(&agent_id, claim.session) {
        info!(agent_id = %agent_id, "Agent tunnel closed");
    }
    lifecycle.advance(TunnelState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_state_order() {
        use TunnelState::*;
        let path = [Connecting, Registered, Active, Closing, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?}", pair);
        }

        assert!(!Active.can_advance_to(Registered));
        assert!(!Closed.can_advance_to(Active));
        assert!(!Active.can_advance_to(Closed));
        assert!(Registered.can_advance_to(Closed));
    }
}
