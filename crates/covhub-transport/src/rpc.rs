//! JSON-RPC over a byte stream

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use covhub_proto::{ClientCodec, RpcMethod, RpcRequest, RpcResponse, ServerCodec};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Calls waiting for a response, keyed by request id
#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, oneshot::Sender<RpcResponse>>,
    closed: bool,
}

/// Client side of the agent RPC protocol
///
/// Calls may run concurrently; responses are matched to calls by id. A
/// background task reads responses until the stream ends, after which every
/// outstanding and future call fails with [`TransportError::ConnectionClosed`].
pub struct RpcClient {
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, ClientCodec>>,
    pending: Arc<Mutex<PendingCalls>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    /// Start a client over `io`; must be called inside a tokio runtime
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let writer: BoxedWriter = Box::new(write_half);

        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let closed = CancellationToken::new();

        let reader = tokio::spawn(Self::reader_task(
            FramedRead::new(read_half, ClientCodec::new()),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, ClientCodec::new())),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        }
    }

    /// Reader task - dispatches responses to waiting calls
    async fn reader_task<R>(
        mut frames: FramedRead<R, ClientCodec>,
        pending: Arc<Mutex<PendingCalls>>,
        closed: CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(response) => {
                    let waiter = lock(&pending).calls.remove(&response.id);
                    match waiter {
                        Some(tx) => {
                            trace!(id = response.id, "Dispatching RPC response");
                            let _ = tx.send(response);
                        }
                        None => warn!(id = response.id, "Dropping response to unknown call"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Invalid RPC frame, closing");
                    break;
                }
            }
        }

        debug!("RPC reader task ended");
        let mut pending = lock(&pending);
        pending.closed = true;
        // Dropping the senders fails every waiting call.
        pending.calls.clear();
        closed.cancel();
    }

    /// Invoke `method` on the peer, waiting at most `timeout` for the answer
    pub async fn call(
        &self,
        method: RpcMethod,
        timeout: Duration,
    ) -> TransportResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(TransportError::ConnectionClosed);
            }
            pending.calls.insert(id, tx);
        }

        let exchange = async {
            self.writer
                .lock()
                .await
                .send(RpcRequest::new(method, id))
                .await?;
            rx.await.map_err(|_| TransportError::ConnectionClosed)
        };

        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                lock(&self.pending).calls.remove(&id);
                return Err(e);
            }
            Err(_) => {
                lock(&self.pending).calls.remove(&id);
                debug!(%method, id, "RPC call timed out");
                return Err(TransportError::Timeout(timeout));
            }
        };

        match response.error {
            Some(message) if !message.is_empty() => Err(TransportError::Remote { method, message }),
            _ => Ok(response.result),
        }
    }

    /// Whether the response stream has ended
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the response stream has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stop sending; the peer sees EOF on its side of the stream
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock(pending: &Mutex<PendingCalls>) -> std::sync::MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Agent-side handler for incoming calls
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: RpcMethod) -> Result<serde_json::Value, String>;
}

/// Serve calls from `io` sequentially until the stream ends
pub async fn serve_rpc<T, H>(io: T, handler: H) -> TransportResult<()>
where
    T: AsyncRead + AsyncWrite + Send,
    H: RpcHandler,
{
    let (read_half, write_half) = tokio::io::split(io);
    let mut requests = FramedRead::new(read_half, ServerCodec::new());
    let mut responses = FramedWrite::new(write_half, ServerCodec::new());

    while let Some(request) = requests.next().await {
        let request = request?;
        let response = match RpcMethod::parse(&request.method) {
            Some(method) => match handler.handle(method).await {
                Ok(result) => RpcResponse::success(request.id, result),
                Err(message) => RpcResponse::failure(request.id, message),
            },
            None => RpcResponse::failure(
                request.id,
                format!("rpc: can't find method {}", request.method),
            ),
        };
        responses.send(response).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct StaticAgent {
        profile: &'static str,
        resets: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for StaticAgent {
        async fn handle(&self, method: RpcMethod) -> Result<serde_json::Value, String> {
            match method {
                RpcMethod::GetProfile => Ok(serde_json::Value::String(self.profile.to_string())),
                RpcMethod::ResetProfile => {
                    self.resets.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            }
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl RpcHandler for FailingAgent {
        async fn handle(&self, _method: RpcMethod) -> Result<serde_json::Value, String> {
            Err("counters unavailable".to_string())
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (client_io, agent_io) = tokio::io::duplex(64 * 1024);
        let agent = StaticAgent {
            profile: "mode: count\nm.go:1.1,2.2 1 3\n",
            resets: AtomicUsize::new(0),
        };
        tokio::spawn(serve_rpc(agent_io, agent));

        let client = RpcClient::new(client_io);
        let result = client
            .call(RpcMethod::GetProfile, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("mode: count\nm.go:1.1,2.2 1 3\n"));

        let reset = client
            .call(RpcMethod::ResetProfile, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(reset.is_null());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_matched_by_id() {
        let (client_io, agent_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_rpc(
            agent_io,
            StaticAgent {
                profile: "mode: set\n",
                resets: AtomicUsize::new(0),
            },
        ));

        let client = Arc::new(RpcClient::new(client_io));
        let calls: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .call(RpcMethod::GetProfile, Duration::from_secs(5))
                        .await
                })
            })
            .collect();

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), serde_json::json!("mode: set\n"));
        }
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client_io, agent_io) = tokio::io::duplex(4096);
        tokio::spawn(serve_rpc(agent_io, FailingAgent));

        let client = RpcClient::new(client_io);
        let err = client
            .call(RpcMethod::GetProfile, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            TransportError::Remote { method, message } => {
                assert_eq!(method, RpcMethod::GetProfile);
                assert_eq!(message, "counters unavailable");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (client_io, _agent_io) = tokio::io::duplex(4096);
        let client = RpcClient::new(client_io);

        let err = client
            .call(RpcMethod::GetProfile, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.is_transient());
        assert!(lock(&client.pending).calls.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_call_fails_when_stream_ends() {
        let (client_io, mut pipe) = crate::stream::MessageStream::pair(8);
        let client = Arc::new(RpcClient::new(client_io));

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(RpcMethod::GetProfile, Duration::from_secs(5))
                    .await
            })
        };

        // Wait for the request to hit the wire, then drop the socket side.
        let request = pipe.outbound.recv().await.unwrap();
        assert!(request.ends_with(b"\n"));
        drop(pipe);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        let err = client
            .call(RpcMethod::ResetProfile, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (mut client_io, agent_io) = tokio::io::duplex(4096);
        tokio::spawn(serve_rpc(
            agent_io,
            StaticAgent {
                profile: "",
                resets: AtomicUsize::new(0),
            },
        ));

        client_io
            .write_all(b"{\"method\":\"Agent.Explode\",\"params\":[],\"id\":5}\n")
            .await
            .unwrap();

        let mut frames = FramedRead::new(client_io, ClientCodec::new());
        let response = frames.next().await.unwrap().unwrap();
        assert_eq!(response.id, 5);
        assert_eq!(
            response.error.as_deref(),
            Some("rpc: can't find method Agent.Explode")
        );
    }
}
