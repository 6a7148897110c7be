//! Pool of long-lived remote-shell sessions
//!
//! Sessions are cached per server id so repeated shell-family operations reuse
//! one authenticated connection. A background sweep closes sessions that sit
//! idle, and each live session has its own keepalive task that evicts it when
//! the remote end stops answering.

use crate::transport::{Connector, ShellParams, ShellTransport, TransportError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Statistics for the transport pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Fresh sessions negotiated
    pub negotiations: AtomicU64,
    /// Cached sessions handed out after a successful probe
    pub reuses: AtomicU64,
    /// Sessions closed and removed for any reason
    pub evictions: AtomicU64,
}

impl PoolStats {
    pub fn record_negotiation(&self) {
        self.negotiations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_negotiations(&self) -> u64 {
        self.negotiations.load(Ordering::Relaxed)
    }

    pub fn get_reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Configuration for the transport pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions unused for at least this long are closed by the sweep
    pub idle_timeout: Duration,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// How often each live session is probed
    pub keepalive_interval: Duration,
    /// Deadline for a keepalive probe
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(2 * 60),
            keepalive_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

struct PoolEntry {
    transport: Arc<dyn ShellTransport>,
    last_used: Mutex<Instant>,
}

impl PoolEntry {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }
}

/// Reusable remote-shell sessions keyed by server id.
///
/// Like other long-lived managers, the pool is created behind an `Arc`
/// because its background tasks hold weak references back to it.
pub struct TransportPool {
    entries: RwLock<HashMap<String, Arc<PoolEntry>>>,
    /// Serializes negotiation per server so concurrent misses share one connect
    negotiating: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    stats: Arc<PoolStats>,
}

impl TransportPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        debug!(
            idle_timeout_secs = config.idle_timeout.as_secs(),
            sweep_interval_secs = config.sweep_interval.as_secs(),
            keepalive_secs = config.keepalive_interval.as_secs(),
            "Transport pool initialized"
        );

        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            negotiating: DashMap::new(),
            connector,
            config,
            stats: Arc::new(PoolStats::default()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.entries.read().contains_key(server_id)
    }

    /// Get a live session for `server_id`, reusing the cached one when it
    /// still answers a probe and negotiating a new one otherwise.
    pub async fn acquire(
        self: &Arc<Self>,
        server_id: &str,
        params: &ShellParams,
        timeout: Duration,
    ) -> Result<Arc<dyn ShellTransport>, TransportError> {
        if let Some(transport) = self.reuse(server_id, timeout).await {
            return Ok(transport);
        }

        let gate = self.gate(server_id);
        let result = {
            let _guard = gate.lock().await;
            self.negotiate(server_id, params, timeout).await
        };
        drop(gate);
        self.release_gate(server_id);
        result
    }

    /// Connect and pool a fresh session. Callers hold the server's gate.
    async fn negotiate(
        self: &Arc<Self>,
        server_id: &str,
        params: &ShellParams,
        timeout: Duration,
    ) -> Result<Arc<dyn ShellTransport>, TransportError> {
        // Another caller may have finished negotiating while we waited
        if let Some(transport) = self.reuse(server_id, timeout).await {
            return Ok(transport);
        }

        let transport = match tokio::time::timeout(timeout, self.connector.connect(params)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };
        self.stats.record_negotiation();

        let entry = Arc::new(PoolEntry {
            transport: Arc::clone(&transport),
            last_used: Mutex::new(Instant::now()),
        });

        let replaced = self
            .entries
            .write()
            .insert(server_id.to_string(), Arc::clone(&entry));
        if let Some(old) = replaced {
            old.transport.close().await;
            self.stats.record_eviction();
        }

        self.spawn_keepalive(server_id.to_string(), Arc::downgrade(&entry));
        info!(server_id, "Pooled new shell transport");

        Ok(transport)
    }

    fn gate(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.negotiating
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the server's gate once nobody else holds or waits on it
    fn release_gate(&self, server_id: &str) {
        self.negotiating
            .remove_if(server_id, |_, gate| Arc::strong_count(gate) == 1);
    }

    /// Hand out the cached session if it passes a liveness probe.
    /// A failing session is evicted.
    async fn reuse(&self, server_id: &str, timeout: Duration) -> Option<Arc<dyn ShellTransport>> {
        let entry = self.entries.read().get(server_id).cloned()?;

        match tokio::time::timeout(timeout, entry.transport.probe()).await {
            Ok(Ok(())) => {
                entry.touch();
                self.stats.record_reuse();
                debug!(server_id, "Reusing pooled shell transport");
                Some(Arc::clone(&entry.transport))
            }
            Ok(Err(e)) => {
                warn!(server_id, error = %e, "Pooled transport failed probe, reconnecting");
                self.evict_entry(server_id, &entry).await;
                None
            }
            Err(_) => {
                warn!(server_id, "Pooled transport probe timed out, reconnecting");
                self.evict_entry(server_id, &entry).await;
                None
            }
        }
    }

    /// Close and remove the session for `server_id`, if any.
    ///
    /// Called whenever stored credentials change or the server is deleted.
    /// Waits for an in-flight negotiation for the same server to finish so
    /// the session it produces is closed too.
    pub async fn evict(&self, server_id: &str) {
        let gate = self.gate(server_id);
        {
            let _guard = gate.lock().await;
            let removed = self.entries.write().remove(server_id);
            if let Some(entry) = removed {
                entry.transport.close().await;
                self.stats.record_eviction();
                info!(server_id, "Evicted pooled shell transport");
            }
        }
        drop(gate);
        self.release_gate(server_id);
    }

    /// Remove `entry` only if it is still the current session for the server
    async fn evict_entry(&self, server_id: &str, entry: &Arc<PoolEntry>) {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(server_id) {
                Some(current) if Arc::ptr_eq(current, entry) => entries.remove(server_id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            entry.transport.close().await;
            self.stats.record_eviction();
        }
    }

    /// Close every session whose idle time reached the threshold
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let stale: Vec<(String, Arc<PoolEntry>)> = {
            let mut entries = self.entries.write();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.idle_for(now) >= idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (server_id, entry) in &stale {
            entry.transport.close().await;
            self.stats.record_eviction();
            info!(server_id, "Evicted idle shell transport");
        }

        stale.len()
    }

    /// Close every session
    pub async fn shutdown(&self) {
        self.negotiating.retain(|_, gate| Arc::strong_count(gate) > 1);
        let drained: Vec<Arc<PoolEntry>> = self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.transport.close().await;
            self.stats.record_eviction();
        }
    }

    /// Start the idle sweep. The task stops when `shutdown_rx` flips to true
    /// or the pool is dropped.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let evicted = pool.sweep_idle().await;
                        if evicted > 0 {
                            debug!(evicted, remaining = pool.len(), "Idle sweep finished");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            if let Some(pool) = pool.upgrade() {
                                pool.shutdown().await;
                            }
                            info!("Transport pool shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_keepalive(self: &Arc<Self>, server_id: String, entry: Weak<PoolEntry>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.keepalive_interval;
        let probe_timeout = self.config.probe_timeout;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let (Some(pool), Some(entry)) = (pool.upgrade(), entry.upgrade()) else {
                    break;
                };
                let current = pool
                    .entries
                    .read()
                    .get(&server_id)
                    .map(|e| Arc::ptr_eq(e, &entry))
                    .unwrap_or(false);
                if !current {
                    break;
                }

                let healthy = matches!(
                    tokio::time::timeout(probe_timeout, entry.transport.probe()).await,
                    Ok(Ok(()))
                );
                if !healthy {
                    warn!(server_id, "Keepalive probe failed, evicting transport");
                    pool.evict_entry(&server_id, &entry).await;
                    break;
                }
            }
            debug!(server_id, "Keepalive task finished");
        });
    }
}
