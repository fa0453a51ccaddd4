//! Plumbing shared by every WebSocket the server holds
//!
//! Each socket gets a writer task draining an outbound queue and a keepalive
//! task probing the peer. Both report trouble by firing the socket's exit
//! signal; the owning connection task then calls [`SocketTasks::close`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use covhub_control::ExitSignal;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::KeepaliveConfig;
use crate::AppState;

/// Messages queued for one socket
const OUTBOUND_CAPACITY: usize = 256;

/// Time of the last sign of life from the peer
#[derive(Debug)]
pub struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer and keepalive tasks of one socket
pub struct SocketTasks {
    key: String,
    outbound: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
    liveness: Arc<Liveness>,
}

impl SocketTasks {
    /// Spawn the writer and keepalive tasks; `key` names the socket in the task tracker
    pub fn start(
        state: &AppState,
        key: String,
        sink: SplitSink<WebSocket, Message>,
        exit: Arc<ExitSignal>,
    ) -> Self {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let liveness = Arc::new(Liveness::new());

        let writer = tokio::spawn(writer_task(key.clone(), sink, rx, exit.clone()));
        let keepalive = tokio::spawn(keepalive_task(
            key.clone(),
            state.config.keepalive,
            outbound.clone(),
            liveness.clone(),
            exit,
        ));
        state.tasks.register(key.clone(), keepalive);

        Self {
            key,
            outbound,
            writer,
            liveness,
        }
    }

    pub fn outbound(&self) -> &mpsc::Sender<Message> {
        &self.outbound
    }

    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// Stop probing, send a close frame and give the writer `close_grace` to flush it
    pub async fn close(self, state: &AppState) {
        state.tasks.unregister(&self.key);

        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        };
        if self
            .outbound
            .try_send(Message::Close(Some(frame)))
            .is_err()
        {
            trace!(socket = %self.key, "Writer gone or backed up, skipping close frame");
        }
        drop(self.outbound);

        let abort = self.writer.abort_handle();
        if tokio::time::timeout(state.config.keepalive.close_grace, self.writer)
            .await
            .is_err()
        {
            debug!(socket = %self.key, "Writer did not flush in time");
            abort.abort();
        }
    }
}

async fn writer_task(
    key: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    exit: Arc<ExitSignal>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(socket = %key, error = %e, "Socket write failed");
            exit.fire();
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
    trace!(socket = %key, "Writer task ended");
}

/// Ping every `interval`; fire `exit` once no pong arrived for `deadline`
async fn keepalive_task(
    key: String,
    config: KeepaliveConfig,
    outbound: mpsc::Sender<Message>,
    liveness: Arc<Liveness>,
    exit: Arc<ExitSignal>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let left = remaining(liveness.last_seen(), config.deadline);
        tokio::select! {
            _ = exit.cancelled() => return,
            _ = tokio::time::sleep(left) => {
                // A pong may have arrived while sleeping.
                if remaining(liveness.last_seen(), config.deadline).is_zero() {
                    warn!(socket = %key, deadline = ?config.deadline, "No pong in time, closing socket");
                    exit.fire();
                    return;
                }
            }
            _ = interval.tick() => {
                trace!(socket = %key, "Sending ping");
                if outbound.send(Message::Ping(Bytes::new())).await.is_err() {
                    exit.fire();
                    return;
                }
            }
        }
    }
}

/// Time left before a socket last seen at `last_seen` expires
pub fn remaining(last_seen: Instant, deadline: Duration) -> Duration {
    (last_seen + deadline).saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_liveness_touch_extends_deadline() {
        let liveness = Liveness::new();
        let deadline = Duration::from_secs(20);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(remaining(liveness.last_seen(), deadline), Duration::from_secs(5));

        liveness.touch();
        assert_eq!(remaining(liveness.last_seen(), deadline), deadline);

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(remaining(liveness.last_seen(), deadline), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_then_expires() {
        let config = KeepaliveConfig {
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(20),
            close_grace: Duration::from_secs(1),
        };
        let (tx, mut rx) = mpsc::channel(16);
        let exit = Arc::new(ExitSignal::new());
        let liveness = Arc::new(Liveness::new());

        let task = tokio::spawn(keepalive_task(
            "test".to_string(),
            config,
            tx,
            liveness,
            exit.clone(),
        ));

        // Pings at 10s and 20s race the 20s deadline; the peer never answers.
        task.await.unwrap();
        assert!(exit.is_fired());
        assert!(matches!(rx.recv().await, Some(Message::Ping(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stays_up_while_peer_answers() {
        let config = KeepaliveConfig {
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(20),
            close_grace: Duration::from_secs(1),
        };
        let (tx, mut rx) = mpsc::channel(16);
        let exit = Arc::new(ExitSignal::new());
        let liveness = Arc::new(Liveness::new());

        let task = tokio::spawn(keepalive_task(
            "test".to_string(),
            config,
            tx,
            liveness.clone(),
            exit.clone(),
        ));

        for _ in 0..5 {
            assert!(matches!(rx.recv().await, Some(Message::Ping(_))));
            liveness.touch();
        }
        assert!(!exit.is_fired());

        exit.fire();
        task.await.unwrap();
    }
}
