//! Boundary-facing facade over adapters, pool and hub
//!
//! Every capability is keyed by server id. The service looks the server up,
//! builds a fresh adapter for the call, and pushes side effects (status
//! transitions, metrics, alerts) into the event hub.

use crate::adapter::{LogStream, ProxyAdapter};
use crate::error::AdapterError;
use crate::factory::AdapterFactory;
use crate::hub::EventHub;
use crate::model::{Alert, ConfigValidation, ProxyConfig, ServerDescriptor, ServerMetrics, ServerStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Read access to persisted server records
pub trait ServerDirectory: Send + Sync {
    fn get(&self, id: &str) -> Option<ServerDescriptor>;
    fn list(&self) -> Vec<ServerDescriptor>;
}

/// Directory held in memory, seeded from the config file
#[derive(Default)]
pub struct InMemoryDirectory {
    servers: RwLock<HashMap<String, ServerDescriptor>>,
}

impl InMemoryDirectory {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers: RwLock::new(servers.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }

    pub fn upsert(&self, server: ServerDescriptor) {
        self.servers.write().insert(server.id.clone(), server);
    }

    pub fn remove(&self, id: &str) -> Option<ServerDescriptor> {
        self.servers.write().remove(id)
    }

    /// Swap in a new inventory, reporting which ids changed
    pub fn replace_all(&self, servers: Vec<ServerDescriptor>) -> InventoryDiff {
        let incoming: HashMap<String, ServerDescriptor> = servers.into_iter().map(|s| (s.id.clone(), s)).collect();
        let mut current = self.servers.write();
        let mut diff = InventoryDiff::default();

        for (id, server) in &incoming {
            match current.get(id) {
                None => diff.added.push(id.clone()),
                Some(existing) if existing != server => diff.updated.push(id.clone()),
                Some(_) => {}
            }
        }
        for id in current.keys() {
            if !incoming.contains_key(id) {
                diff.removed.push(id.clone());
            }
        }

        *current = incoming;
        diff.added.sort();
        diff.updated.sort();
        diff.removed.sort();
        diff
    }
}

/// Ids touched by [`InMemoryDirectory::replace_all`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InventoryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl InventoryDiff {
    /// Servers whose pooled sessions and status are stale
    pub fn stale(&self) -> impl Iterator<Item = &String> {
        self.removed.iter().chain(self.updated.iter())
    }
}

impl ServerDirectory for InMemoryDirectory {
    fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.servers.read().get(id).cloned()
    }

    fn list(&self) -> Vec<ServerDescriptor> {
        let mut servers: Vec<_> = self.servers.read().values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }
}

/// Deadlines applied to each kind of remote call
#[derive(Debug, Clone)]
pub struct OperationTimeouts {
    pub ping: Duration,
    pub metrics: Duration,
    pub config: Duration,
    pub put_config: Duration,
    pub reload: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(5),
            metrics: Duration::from_secs(10),
            config: Duration::from_secs(10),
            put_config: Duration::from_secs(30),
            reload: Duration::from_secs(15),
        }
    }
}

/// How many consecutive results flip a server's reported status
#[derive(Debug, Clone)]
pub struct StatusPolicy {
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            success_threshold: 1,
        }
    }
}

/// Tracks consecutive reachability results for one server
struct StatusState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    status: ServerStatus,
}

impl Default for StatusState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            status: ServerStatus::Unknown,
        }
    }
}

impl StatusState {
    /// Record one observation; returns the new status on a transition
    fn observe(&mut self, online: bool, policy: &StatusPolicy) -> Option<ServerStatus> {
        if online {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            let settled = self.status == ServerStatus::Unknown
                || self.consecutive_successes >= policy.success_threshold;
            if self.status != ServerStatus::Online && settled {
                self.status = ServerStatus::Online;
                return Some(self.status);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            let settled = self.status == ServerStatus::Unknown
                || self.consecutive_failures >= policy.failure_threshold;
            if self.status != ServerStatus::Offline && settled {
                self.status = ServerStatus::Offline;
                return Some(self.status);
            }
        }
        None
    }
}

/// Result of a health check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub server_id: String,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct FleetService {
    directory: Arc<dyn ServerDirectory>,
    factory: AdapterFactory,
    hub: Arc<EventHub>,
    timeouts: OperationTimeouts,
    policy: StatusPolicy,
    statuses: Mutex<HashMap<String, StatusState>>,
}

impl FleetService {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        factory: AdapterFactory,
        hub: Arc<EventHub>,
        timeouts: OperationTimeouts,
        policy: StatusPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            factory,
            hub,
            timeouts,
            policy,
            statuses: Mutex::new(HashMap::new()),
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn directory(&self) -> &Arc<dyn ServerDirectory> {
        &self.directory
    }

    pub fn timeouts(&self) -> &OperationTimeouts {
        &self.timeouts
    }

    fn lookup(&self, server_id: &str) -> Result<ServerDescriptor, AdapterError> {
        self.directory
            .get(server_id)
            .ok_or_else(|| AdapterError::ServerNotFound(server_id.to_string()))
    }

    fn adapter(&self, server_id: &str) -> Result<Box<dyn ProxyAdapter>, AdapterError> {
        let server = self.lookup(server_id)?;
        self.factory.build(&server)
    }

    /// Masked API token for listings, never the plaintext
    pub fn api_token_mask(&self, server: &ServerDescriptor) -> Option<String> {
        self.factory.api_token_mask(server)
    }

    /// Last reported status, `Unknown` until the first check
    pub fn status_of(&self, server_id: &str) -> ServerStatus {
        self.statuses
            .lock()
            .get(server_id)
            .map(|s| s.status)
            .unwrap_or(ServerStatus::Unknown)
    }

    /// Feed one reachability result through the status policy, publishing a
    /// status change when the reported status flips
    pub fn record_status(&self, server_id: &str, online: bool) -> ServerStatus {
        let (status, transition) = {
            let mut statuses = self.statuses.lock();
            let state = statuses.entry(server_id.to_string()).or_default();
            let transition = state.observe(online, &self.policy);
            (state.status, transition)
        };

        if let Some(status) = transition {
            info!(server_id, status = status.as_str(), "Server status changed");
            self.hub.broadcast_status_change(server_id, status);
        }
        status
    }

    pub async fn check_health(&self, server_id: &str) -> Result<HealthReport, AdapterError> {
        let adapter = self.adapter(server_id)?;

        let (latency_ms, error) = match adapter.ping(self.timeouts.ping).await {
            Ok(latency) => (Some(latency.as_secs_f64() * 1000.0), None),
            Err(e) => {
                debug!(server_id, error = %e, "Health check failed");
                (None, Some(e.to_string()))
            }
        };
        let status = self.record_status(server_id, error.is_none());

        Ok(HealthReport {
            server_id: server_id.to_string(),
            status,
            latency_ms,
            error,
            checked_at: Utc::now(),
        })
    }

    /// Fetch a metrics snapshot and fan it out to subscribed observers
    pub async fn metrics(&self, server_id: &str) -> Result<ServerMetrics, AdapterError> {
        let metrics = self.adapter(server_id)?.get_metrics(self.timeouts.metrics).await?;
        self.hub.broadcast_metrics(metrics.clone());
        Ok(metrics)
    }

    pub async fn config(&self, server_id: &str) -> Result<ProxyConfig, AdapterError> {
        self.adapter(server_id)?.get_config(self.timeouts.config).await
    }

    pub async fn put_config(&self, server_id: &str, content: &str) -> Result<ConfigValidation, AdapterError> {
        let result = self
            .adapter(server_id)?
            .put_config(self.timeouts.put_config, content)
            .await?;
        if !result.is_valid {
            info!(server_id, errors = result.errors.len(), "Configuration rejected by backend");
        }
        Ok(result)
    }

    pub async fn reload(&self, server_id: &str) -> Result<(), AdapterError> {
        self.adapter(server_id)?.reload(self.timeouts.reload).await
    }

    pub async fn tail_logs(&self, server_id: &str, cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError> {
        self.adapter(server_id)?.tail_logs(cancel).await
    }

    /// Drop any pooled session for the server. Call after credential
    /// rotation or server deletion.
    pub async fn invalidate(&self, server_id: &str) {
        self.factory.pool().evict(server_id).await;
        if self.directory.get(server_id).is_none() {
            self.statuses.lock().remove(server_id);
        }
        info!(server_id, "Invalidated server connection state");
    }

    /// Hook fired by storage after an alert record is inserted
    pub fn on_alert_created(&self, alert: Alert) {
        if alert.title.is_empty() {
            warn!(alert_id = %alert.id, "Broadcasting alert without a title");
        }
        self.hub.broadcast_alert(alert);
    }
}
