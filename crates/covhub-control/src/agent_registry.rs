//! Agent registry for tracking connected coverage agents
//!
//! Agents are keyed by a fingerprint of where they run and how they were
//! started, so a restarted process on the same host gets a new id while a
//! reconnecting one keeps its id. Each entry tracks up to two sockets: the RPC
//! tunnel and the watch push stream. An entry is dropped as soon as neither
//! socket is attached.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use covhub_proto::AgentMetadata;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::connection::AgentConnection;
use crate::error::RegistryError;
use crate::signal::ExitSignal;

/// Which sockets of an agent are attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Disconnected,
    TunnelOnly,
    WatchOnly,
    Both,
}

impl AgentStatus {
    pub fn has_tunnel(self) -> bool {
        matches!(self, AgentStatus::TunnelOnly | AgentStatus::Both)
    }

    pub fn has_watch(self) -> bool {
        matches!(self, AgentStatus::WatchOnly | AgentStatus::Both)
    }

    pub fn with_tunnel(self) -> Self {
        Self::from_parts(true, self.has_watch())
    }

    pub fn without_tunnel(self) -> Self {
        Self::from_parts(false, self.has_watch())
    }

    pub fn with_watch(self) -> Self {
        Self::from_parts(self.has_tunnel(), true)
    }

    pub fn without_watch(self) -> Self {
        Self::from_parts(self.has_tunnel(), false)
    }

    fn from_parts(tunnel: bool, watch: bool) -> Self {
        match (tunnel, watch) {
            (false, false) => AgentStatus::Disconnected,
            (true, false) => AgentStatus::TunnelOnly,
            (false, true) => AgentStatus::WatchOnly,
            (true, true) => AgentStatus::Both,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Disconnected => "disconnected",
            AgentStatus::TunnelOnly => "tunnel_only",
            AgentStatus::WatchOnly => "watch_only",
            AgentStatus::Both => "both",
        };
        f.write_str(s)
    }
}

/// Agent id: the first 6 bytes of `sha256(remote_ip + hostname + cmdline + pid)` in hex
pub fn fingerprint(remote_ip: &str, hostname: &str, cmdline: &str, pid: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [remote_ip, hostname, cmdline, pid] {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Public view of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub remote_ip: String,
    pub hostname: String,
    pub pid: String,
    pub cmdline: String,
    pub extra: String,
    pub status: AgentStatus,
    pub connected_at: DateTime<Utc>,
}

/// Registry entry with the server-private handles
struct RegisteredAgent {
    info: AgentInfo,
    tunnel_session: u64,
    watch_session: u64,
    connection: Option<Arc<AgentConnection>>,
    tunnel_exit: Option<Arc<ExitSignal>>,
    watch_exit: Option<Arc<ExitSignal>>,
}

impl RegisteredAgent {
    /// Fire the exit signal of every attached socket
    fn close_all(&self) {
        if let Some(exit) = &self.tunnel_exit {
            exit.fire();
        }
        if let Some(exit) = &self.watch_exit {
            exit.fire();
        }
    }
}

/// Granted tunnel slot
#[derive(Debug, Clone)]
pub struct TunnelClaim {
    pub agent_id: String,
    /// Identifies this tunnel; a stale session can never release a newer one
    pub session: u64,
    pub exit: Arc<ExitSignal>,
}

/// Granted watch stream slot
#[derive(Debug, Clone)]
pub struct WatchClaim {
    pub agent_id: String,
    pub session: u64,
    pub exit: Arc<ExitSignal>,
}

/// Selects agents by id; an empty selection matches every agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdFilter(Option<HashSet<String>>);

impl IdFilter {
    pub fn all() -> Self {
        Self(None)
    }

    /// Parse a comma separated id list; blank input selects everything
    pub fn parse(query: &str) -> Self {
        Self::from_ids(query.split(','))
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: HashSet<String> = ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            Self(None)
        } else {
            Self(Some(ids))
        }
    }

    pub fn matches(&self, id: &str) -> bool {
        match &self.0 {
            Some(ids) => ids.contains(id),
            None => true,
        }
    }

    /// Explicitly selected ids, sorted
    pub fn ids(&self) -> Option<Vec<&str>> {
        self.0.as_ref().map(|ids| {
            let mut ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            ids.sort_unstable();
            ids
        })
    }
}

/// Registry of connected agents
///
/// All mutation goes through one lock, so claiming a slot is an atomic
/// insert-if-absent.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    next_session: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        tracing::info!("Creating new agent registry");
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredAgent>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredAgent>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Claim the tunnel slot of the agent described by `metadata`
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] if that agent already has a tunnel.
    pub fn claim_tunnel(
        &self,
        metadata: &AgentMetadata,
        remote_ip: &str,
    ) -> Result<TunnelClaim, RegistryError> {
        let id = fingerprint(
            remote_ip,
            &metadata.hostname,
            &metadata.cmdline,
            &metadata.pid,
        );
        let exit = Arc::new(ExitSignal::new());
        let session = self.session();

        let mut agents = self.write();
        match agents.get_mut(&id) {
            Some(agent) if agent.info.status.has_tunnel() => {
                tracing::warn!(agent_id = %id, hostname = %metadata.hostname, "Rejected duplicate tunnel");
                return Err(RegistryError::Duplicate(id));
            }
            Some(agent) => {
                agent.info.status = agent.info.status.with_tunnel();
                agent.info.extra = metadata.extra.clone();
                agent.tunnel_session = session;
                agent.tunnel_exit = Some(exit.clone());
                agent.connection = None;
                tracing::info!(agent_id = %id, status = %agent.info.status, "Tunnel attached to known agent");
            }
            None => {
                agents.insert(
                    id.clone(),
                    RegisteredAgent {
                        info: AgentInfo {
                            id: id.clone(),
                            remote_ip: remote_ip.to_string(),
                            hostname: metadata.hostname.clone(),
                            pid: metadata.pid.clone(),
                            cmdline: metadata.cmdline.clone(),
                            extra: metadata.extra.clone(),
                            status: AgentStatus::TunnelOnly,
                            connected_at: Utc::now(),
                        },
                        tunnel_session: session,
                        watch_session: 0,
                        connection: None,
                        tunnel_exit: Some(exit.clone()),
                        watch_exit: None,
                    },
                );
                tracing::info!(
                    agent_id = %id,
                    hostname = %metadata.hostname,
                    pid = %metadata.pid,
                    cmdline = %metadata.cmdline,
                    remote_ip = %remote_ip,
                    "Registered new agent"
                );
            }
        }

        Ok(TunnelClaim {
            agent_id: id,
            session,
            exit,
        })
    }

    /// Install the RPC connection of a claimed tunnel
    ///
    /// Returns `false` if the claim is no longer current.
    pub fn activate_tunnel(
        &self,
        agent_id: &str,
        session: u64,
        connection: Arc<AgentConnection>,
    ) -> bool {
        let mut agents = self.write();
        match agents.get_mut(agent_id) {
            Some(agent) if agent.tunnel_session == session && agent.info.status.has_tunnel() => {
                agent.connection = Some(connection);
                true
            }
            _ => false,
        }
    }

    /// Release a tunnel slot
    ///
    /// Returns `true` exactly once per claimed session.
    pub fn release_tunnel(&self, agent_id: &str, session: u64) -> bool {
        let mut agents = self.write();
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };
        if agent.tunnel_session != session || !agent.info.status.has_tunnel() {
            return false;
        }

        agent.info.status = agent.info.status.without_tunnel();
        agent.connection = None;
        if let Some(exit) = agent.tunnel_exit.take() {
            exit.fire();
        }

        if agent.info.status == AgentStatus::Disconnected {
            agents.remove(agent_id);
            tracing::info!(agent_id = %agent_id, "Unregistered agent");
        } else {
            tracing::info!(agent_id = %agent_id, "Tunnel detached, watch stream still attached");
        }
        true
    }

    /// Claim the watch stream slot of a registered agent
    pub fn attach_watch(&self, agent_id: &str) -> Result<WatchClaim, RegistryError> {
        let session = self.session();
        let mut agents = self.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;

        if agent.info.status.has_watch() {
            return Err(RegistryError::WatchAttached(agent_id.to_string()));
        }

        let exit = Arc::new(ExitSignal::new());
        agent.info.status = agent.info.status.with_watch();
        agent.watch_session = session;
        agent.watch_exit = Some(exit.clone());
        tracing::info!(agent_id = %agent_id, "Watch stream attached");

        Ok(WatchClaim {
            agent_id: agent_id.to_string(),
            session,
            exit,
        })
    }

    /// Release a watch stream slot; `true` exactly once per claimed session
    pub fn release_watch(&self, agent_id: &str, session: u64) -> bool {
        let mut agents = self.write();
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };
        if agent.watch_session != session || !agent.info.status.has_watch() {
            return false;
        }

        agent.info.status = agent.info.status.without_watch();
        if let Some(exit) = agent.watch_exit.take() {
            exit.fire();
        }
        if agent.info.status == AgentStatus::Disconnected {
            agents.remove(agent_id);
            tracing::info!(agent_id = %agent_id, "Unregistered agent");
        } else {
            tracing::debug!(agent_id = %agent_id, "Watch stream detached");
        }
        true
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.read().get(agent_id).map(|a| a.info.clone())
    }

    /// Agents selected by `filter`, sorted by id
    pub fn list(&self, filter: &IdFilter) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .read()
            .values()
            .filter(|a| filter.matches(&a.info.id))
            .map(|a| a.info.clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// RPC connection of an agent with an active tunnel
    pub fn connection(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.read()
            .get(agent_id)
            .and_then(|a| a.connection.clone())
    }

    /// Active connections of every agent selected by `filter`, sorted by id
    pub fn connections(&self, filter: &IdFilter) -> Vec<(AgentInfo, Arc<AgentConnection>)> {
        let mut connections: Vec<(AgentInfo, Arc<AgentConnection>)> = self
            .read()
            .values()
            .filter(|a| filter.matches(&a.info.id))
            .filter_map(|a| a.connection.clone().map(|c| (a.info.clone(), c)))
            .collect();
        connections.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        connections
    }

    /// Remove an agent, closing all of its sockets
    pub fn remove(&self, agent_id: &str) -> Option<AgentInfo> {
        let removed = self.write().remove(agent_id);
        match removed {
            Some(agent) => {
                agent.close_all();
                tracing::info!(agent_id = %agent_id, "Removed agent");
                Some(agent.info)
            }
            None => {
                tracing::warn!(agent_id = %agent_id, "Attempted to remove unknown agent");
                None
            }
        }
    }

    /// Remove every agent, closing all sockets
    pub fn drain(&self) -> Vec<AgentInfo> {
        let drained: Vec<RegisteredAgent> = self.write().drain().map(|(_, a)| a).collect();
        for agent in &drained {
            agent.close_all();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Drained agent registry");
        }
        drained.into_iter().map(|a| a.info).collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }
}
