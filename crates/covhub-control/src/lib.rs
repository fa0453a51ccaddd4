//! Control plane for the coverage registry
//!
//! Owns every piece of shared server state: the agent registry, the legacy
//! service store and the watch broadcast hub, plus the [`ControlPlane`]
//! façade that answers queries against them.
pub mod agent_registry;
pub mod connection;
pub mod error;
pub mod facade;
pub mod service_client;
pub mod signal;
pub mod store;
pub mod task_tracker;
pub mod watch;

pub use agent_registry::{
    fingerprint, AgentInfo, AgentRegistry, AgentStatus, IdFilter, TunnelClaim, WatchClaim,
};
pub use connection::{AgentConnection, ProfileSource};
pub use error::{ControlError, RegistryError, StoreError};
pub use facade::{AgentProfileQuery, ClearReport, ControlPlane, ProfileParam};
pub use service_client::ServiceClient;
pub use signal::ExitSignal;
pub use store::{FileStore, MemoryStore, ServiceStore};
pub use task_tracker::TaskTracker;
pub use watch::{EventSink, WatchHub, WatchSubscription};
