//! Query and control façade
//!
//! Every HTTP handler goes through [`ControlPlane`]. It selects agents or
//! legacy services, talks to them concurrently with one timeout per call, and
//! feeds the results to the merge engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use covhub_cover::{merge, Profile};
use covhub_transport::TransportResult;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent_registry::{AgentInfo, AgentRegistry, IdFilter};
use crate::connection::ProfileSource;
use crate::error::{ControlError, RegistryError};
use crate::service_client::ServiceClient;
use crate::store::ServiceStore;

/// Selection of a merged agent profile
#[derive(Debug, Clone, Default)]
pub struct AgentProfileQuery {
    pub ids: IdFilter,
    /// Files whose name contains any of these are dropped
    pub skip_patterns: Vec<String>,
    /// Regex on the agents' `extra` tag; empty matches all
    pub extra: String,
    /// Skip unknown ids and failing agents instead of failing the request
    pub force: bool,
}

/// Body of the legacy profile, clear and remove requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileParam {
    pub force: bool,
    pub service: Vec<String>,
    pub address: Vec<String>,
    /// Regexes of files to keep
    pub coverfile: Vec<String>,
    /// Regexes of files to drop
    pub skipfile: Vec<String>,
}

/// Outcome of clearing agent counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub cleared: Vec<String>,
    /// `(agent id, reason)` of every agent that could not be cleared
    pub failed: Vec<(String, String)>,
}

/// Façade over the agent registry and the legacy service store
pub struct ControlPlane {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn ServiceStore>,
    http: reqwest::Client,
    rpc_timeout: Duration,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn ServiceStore>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            http: reqwest::Client::new(),
            rpc_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    // ----- agents -----

    pub fn list_agents(&self, filter: &IdFilter) -> Vec<AgentInfo> {
        self.registry.list(filter)
    }

    /// Disconnect and forget the selected agents, returning their ids
    pub fn delete_agents(&self, filter: &IdFilter) -> Vec<String> {
        let removed: Vec<String> = self
            .registry
            .list(filter)
            .into_iter()
            .filter_map(|agent| self.registry.remove(&agent.id))
            .map(|agent| agent.id)
            .collect();
        info!(count = removed.len(), "Deleted agents");
        removed
    }

    /// Fetch and merge the profiles of the selected agents
    pub async fn fetch_agent_profile(
        &self,
        query: &AgentProfileQuery,
    ) -> Result<String, ControlError> {
        let extra = compile_optional(&query.extra)?;

        let mut targets = self.registry.connections(&query.ids);
        if let Some(ids) = query.ids.ids() {
            for id in ids {
                if targets.iter().any(|(info, _)| info.id == id) {
                    continue;
                }
                if !query.force {
                    return Err(RegistryError::UnknownAgent(id.to_string()).into());
                }
                warn!(agent_id = %id, "Skipping unknown agent");
            }
        }
        if let Some(extra) = &extra {
            targets.retain(|(info, _)| extra.is_match(&info.extra));
        }
        debug!(agents = targets.len(), "Fetching agent profiles");

        let results = join_all(targets.iter().map(|(info, conn)| async move {
            (info, conn, fetch_with_retry(conn.as_ref()).await)
        }))
        .await;

        let mut profiles = Vec::with_capacity(results.len());
        let mut first_failure: Option<ControlError> = None;
        for (info, conn, result) in results {
            let parsed = result
                .map_err(|e| e.to_string())
                .and_then(|text| Profile::parse(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(profile) => profiles.push(profile),
                Err(reason) => {
                    warn!(agent_id = %info.id, error = %reason, "Failed to fetch agent profile");
                    conn.close();
                    if first_failure.is_none() {
                        first_failure = Some(ControlError::ProfileFetch {
                            source_name: info.id.clone(),
                            reason,
                        });
                    }
                }
            }
        }
        if let Some(err) = first_failure {
            if !query.force {
                return Err(err);
            }
        }

        let mut merged = merge(&profiles)?;
        let skip: Vec<&str> = query
            .skip_patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if !skip.is_empty() {
            merged.retain_files(|file| !skip.iter().any(|p| file.contains(p)));
        }
        Ok(merged.serialize()?)
    }

    /// Zero the counters of the selected agents
    ///
    /// Agents that fail to answer have their tunnel closed and are reported.
    pub async fn clear_agent_counters(
        &self,
        filter: &IdFilter,
        extra: &str,
    ) -> Result<ClearReport, ControlError> {
        let extra = compile_optional(extra)?;
        let mut targets = self.registry.connections(filter);
        if let Some(extra) = &extra {
            targets.retain(|(info, _)| extra.is_match(&info.extra));
        }

        let results = join_all(
            targets
                .iter()
                .map(|(info, conn)| async move { (info, conn, conn.reset_profile().await) }),
        )
        .await;

        let mut report = ClearReport::default();
        for (info, conn, result) in results {
            match result {
                Ok(()) => report.cleared.push(info.id.clone()),
                Err(e) => {
                    warn!(agent_id = %info.id, error = %e, "Failed to clear agent counters");
                    conn.close();
                    report.failed.push((info.id.clone(), e.to_string()));
                }
            }
        }
        info!(
            cleared = report.cleared.len(),
            failed = report.failed.len(),
            "Cleared agent counters"
        );
        Ok(report)
    }

    // ----- legacy services -----

    /// Register a service address, returning it normalized
    pub fn register_service(&self, name: &str, address: &str) -> Result<String, ControlError> {
        let address = normalize_address(address)?;
        if self.store.add(name, &address)? {
            info!(service = %name, address = %address, "Registered service");
        } else {
            debug!(service = %name, address = %address, "Service already registered");
        }
        Ok(address)
    }

    pub fn list_services(&self) -> BTreeMap<String, Vec<String>> {
        self.store.get_all()
    }

    pub fn init_services(&self) -> Result<(), ControlError> {
        self.store.init()?;
        info!("Cleared all registered services");
        Ok(())
    }

    /// Drop the selected addresses from the store, one report line per address
    pub fn remove_services(&self, param: &ProfileParam) -> Result<String, ControlError> {
        let addresses = self.select_services(param, true)?;
        let mut out = String::new();
        for address in addresses {
            self.store.remove(&address)?;
            out.push_str(&format!(
                "Register service {} removed from the center.\n",
                address
            ));
        }
        Ok(out)
    }

    /// Fetch, merge and filter the profiles of the selected services
    pub async fn fetch_service_profile(&self, param: &ProfileParam) -> Result<String, ControlError> {
        let keep = compile_all(&param.coverfile)?;
        let drop = compile_all(&param.skipfile)?;
        let addresses = self.select_services(param, param.force)?;

        let clients: Vec<ServiceClient> = addresses
            .into_iter()
            .map(|address| ServiceClient::new(address, self.http.clone(), self.rpc_timeout))
            .collect();
        let results = join_all(
            clients
                .iter()
                .map(|client| async move { (client, fetch_with_retry(client).await) }),
        )
        .await;

        let mut profiles = Vec::with_capacity(results.len());
        for (client, result) in results {
            let parsed = result
                .map_err(|e| e.to_string())
                .and_then(|text| Profile::parse(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(profile) => profiles.push(profile),
                Err(reason) if param.force => {
                    warn!(address = %client.address(), error = %reason, "Skipping faulty service");
                }
                Err(reason) => {
                    return Err(ControlError::ProfileFetch {
                        source_name: client.label(),
                        reason,
                    })
                }
            }
        }

        let mut merged = merge(&profiles)?;
        if !keep.is_empty() {
            merged.retain_files(|file| keep.iter().any(|re| re.is_match(file)));
        }
        if !drop.is_empty() {
            merged.retain_files(|file| !drop.iter().any(|re| re.is_match(file)));
        }
        Ok(merged.serialize()?)
    }

    /// Clear the counters of the selected services, one report line per service
    pub async fn clear_services(&self, param: &ProfileParam) -> Result<String, ControlError> {
        let addresses = self.select_services(param, true)?;
        let mut out = String::new();
        for address in addresses {
            let client = ServiceClient::new(address, self.http.clone(), self.rpc_timeout);
            let response = client
                .clear_profile()
                .await
                .map_err(|e| ControlError::Clear {
                    source_name: client.label(),
                    reason: e.to_string(),
                })?;
            out.push_str(&format!(
                "Register service {} coverage counter {}\n",
                client.address(),
                response
            ));
        }
        Ok(out)
    }

    /// Resolve a service or address selector to registered addresses
    ///
    /// No selector selects every address. Unknown entries fail unless `force`.
    fn select_services(&self, param: &ProfileParam, force: bool) -> Result<Vec<String>, ControlError> {
        if !param.service.is_empty() && !param.address.is_empty() {
            return Err(ControlError::AmbiguousSelector);
        }

        let all = self.store.get_all();
        let mut selected: Vec<String> = Vec::new();
        let mut push = |address: &String| {
            if !selected.contains(address) {
                selected.push(address.clone());
            }
        };

        if !param.service.is_empty() {
            for name in &param.service {
                match all.get(name) {
                    Some(addresses) => addresses.iter().for_each(&mut push),
                    None if force => debug!(service = %name, "Skipping unknown service"),
                    None => return Err(ControlError::UnknownService(name.clone())),
                }
            }
        } else if !param.address.is_empty() {
            for address in &param.address {
                if all.values().any(|addresses| addresses.contains(address)) {
                    push(address);
                } else if force {
                    debug!(address = %address, "Skipping unknown address");
                } else {
                    return Err(ControlError::UnknownAddress(address.clone()));
                }
            }
        } else {
            all.values().flatten().for_each(&mut push);
        }

        Ok(selected)
    }
}

/// Fetch a profile, repeating the call once after a transient failure
async fn fetch_with_retry<S>(source: &S) -> TransportResult<String>
where
    S: ProfileSource + ?Sized,
{
    match source.fetch_profile().await {
        Err(e) if e.is_transient() => {
            debug!(source = %source.label(), error = %e, "Retrying profile fetch");
            source.fetch_profile().await
        }
        other => other,
    }
}

fn compile_optional(pattern: &str) -> Result<Option<Regex>, ControlError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    compile(pattern).map(Some)
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, ControlError> {
    patterns.iter().map(|p| compile(p)).collect()
}

fn compile(pattern: &str) -> Result<Regex, ControlError> {
    Regex::new(pattern).map_err(|source| ControlError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Validate a service URL and reduce it to `scheme://host[:port]`
fn normalize_address(address: &str) -> Result<String, ControlError> {
    let invalid = |reason: &str| ControlError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(address.trim()).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("unsupported scheme"));
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(invalid("empty host")),
    };

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
