//! Background fleet poller
//!
//! Periodically checks every known server and, for reachable ones, collects a
//! metrics snapshot. Results flow through the service, which publishes status
//! transitions and metrics to the event hub.

use crate::model::ServerStatus;
use crate::service::FleetService;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Poller configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between polling rounds
    pub interval: Duration,
    /// Collect metrics from servers that answered the health check
    pub collect_metrics: bool,
    /// Servers polled at the same time
    pub concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            collect_metrics: true,
            concurrency: 8,
        }
    }
}

/// Summary of one polling round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub online: usize,
    pub metrics_collected: usize,
}

pub struct FleetMonitor {
    service: Arc<FleetService>,
    config: MonitorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl FleetMonitor {
    pub fn new(service: Arc<FleetService>, config: MonitorConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            service,
            config,
            shutdown_rx,
        }
    }

    /// Run the poller until shutdown
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            collect_metrics = self.config.collect_metrics,
            "Fleet monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    let summary = self.poll_all().await;
                    debug!(
                        checked = summary.checked,
                        online = summary.online,
                        metrics = summary.metrics_collected,
                        "Polling round finished"
                    );
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Fleet monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every server once
    pub async fn poll_all(&self) -> PollSummary {
        let servers = self.service.directory().list();
        let concurrency = self.config.concurrency.max(1);

        let results: Vec<(bool, bool)> = futures::stream::iter(servers)
            .map(|server| async move {
                let online = match self.service.check_health(&server.id).await {
                    Ok(report) => report.status == ServerStatus::Online,
                    Err(e) => {
                        warn!(server_id = %server.id, error = %e, "Health check could not run");
                        false
                    }
                };

                let mut collected = false;
                if online && self.config.collect_metrics {
                    match self.service.metrics(&server.id).await {
                        Ok(_) => collected = true,
                        Err(e) => debug!(server_id = %server.id, error = %e, "Metrics collection failed"),
                    }
                }
                (online, collected)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        PollSummary {
            checked: results.len(),
            online: results.iter().filter(|(online, _)| *online).count(),
            metrics_collected: results.iter().filter(|(_, collected)| *collected).count(),
        }
    }
}
