//! Watch stream endpoints
//!
//! Agents push coverage events over a second socket; every event is fanned
//! out to the subscribers attached to the watch endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use covhub_control::{EventSink, ExitSignal, RegistryError, WatchClaim};
use covhub_proto::WatchPushParams;
use covhub_transport::TransportError;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::ErrorResponse;
use crate::socket::SocketTasks;
use crate::AppState;

/// Agent watch push upgrade
#[utoipa::path(
    get,
    path = "/v2/internal/ws/watchstream",
    params(("id" = String, Query, description = "Id of a registered agent")),
    responses(
        (status = 101, description = "Switching to the watch push stream"),
        (status = 400, description = "Unknown agent", body = ErrorResponse),
        (status = 409, description = "Agent already has a watch stream", body = ErrorResponse)
    ),
    tag = "internal"
)]
pub async fn watch_push_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WatchPushParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("missing some params: id", "MISSING_PARAMS")),
        )
            .into_response();
    }

    let claim = match state.registry.attach_watch(params.id.trim()) {
        Ok(claim) => claim,
        Err(e @ RegistryError::WatchAttached(_)) => {
            return (
                StatusCode::CONFLICT,
                Json(ErrorResponse::new(e.to_string(), "WATCH_ATTACHED")),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(e.to_string(), "AGENT_NOT_FOUND")),
            )
                .into_response();
        }
    };

    let failed = (state.clone(), claim.clone());
    ws.on_failed_upgrade(move |e| {
        let (state, claim) = failed;
        warn!(agent_id = %claim.agent_id, error = %e, "Watch upgrade failed");
        state.registry.release_watch(&claim.agent_id, claim.session);
    })
    .on_upgrade(move |socket| run_watch_push(state, claim, socket))
}

async fn run_watch_push(state: Arc<AppState>, claim: WatchClaim, socket: WebSocket) {
    let agent_id = claim.agent_id.clone();
    let exit = claim.exit.clone();
    let (sink, mut stream) = socket.split();
    let tasks = SocketTasks::start(
        &state,
        format!("watch:{}:{}", agent_id, claim.session),
        sink,
        exit.clone(),
    );
    info!(agent_id = %agent_id, "Agent watch stream active");

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    state.hub.publish(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Binary(data))) => {
                    state.hub.publish(data);
                }
                Some(Ok(Message::Pong(_))) => tasks.liveness().touch(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(agent_id = %agent_id, error = %e, "Watch stream read failed");
                    break;
                }
            }
        }
    }

    exit.fire();
    tasks.close(&state).await;
    if state.registry.release_watch(&agent_id, claim.session) {
        info!(agent_id = %agent_id, "Agent watch stream closed");
    }
}

/// Subscriber socket as seen by the watch hub
///
/// Writes never wait: a subscriber whose queue is full is dropped.
struct SocketSink {
    outbound: mpsc::Sender<Message>,
}

#[async_trait]
impl EventSink for SocketSink {
    async fn send_event(&self, event: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8_lossy(&event).into_owned();
        self.outbound
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Rejected("subscriber is not keeping up".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
            })
    }
}

/// Watch subscriber upgrade
#[utoipa::path(
    get,
    path = "/v2/cover/ws/watch",
    responses((status = 101, description = "Switching to the coverage event stream")),
    tag = "cover"
)]
pub async fn watch_subscribe_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_subscriber(state, socket))
}

async fn run_subscriber(state: Arc<AppState>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let exit = Arc::new(ExitSignal::new());
    let key = format!("subscriber:{}", Uuid::new_v4());
    let tasks = SocketTasks::start(&state, key, sink, exit.clone());

    let subscription = state.hub.subscribe(Arc::new(SocketSink {
        outbound: tasks.outbound().clone(),
    }));

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            // The hub dropped this subscriber after a failed write.
            _ = subscription.exit.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Pong(_))) => tasks.liveness().touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %subscription.id, error = %e, "Watch subscriber read failed");
                    break;
                }
            }
        }
    }

    exit.fire();
    state.hub.unsubscribe(&subscription.id);
    tasks.close(&state).await;
}
