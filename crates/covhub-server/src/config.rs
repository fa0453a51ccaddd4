use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where legacy service registrations live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    /// Append-only `name&address` log
    File(PathBuf),
}

/// Liveness probing of every socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Ping period
    pub interval: Duration,
    /// A socket without a pong for this long is closed
    pub deadline: Duration,
    /// How long a closing socket may take to flush its close frame
    pub close_grace: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(20),
            close_grace: Duration::from_secs(1),
        }
    }
}

/// Coverage registry server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP server
    pub bind_addr: SocketAddr,
    pub store: StoreConfig,
    pub keepalive: KeepaliveConfig,
    /// Timeout of every call to an agent or service
    pub rpc_timeout: Duration,
    /// Watch events buffered before new ones are dropped
    pub watch_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            store: StoreConfig::Memory,
            keepalive: KeepaliveConfig::default(),
            rpc_timeout: Duration::from_secs(10),
            watch_queue_capacity: 1024,
        }
    }
}
