//! HAProxy through the stats page and the Data Plane API

use super::{degrade_metrics, AdminApi, LogStream, ProxyAdapter};
use crate::error::AdapterError;
use crate::model::{ConfigValidation, ProxyConfig, ProxyFamily, ServerMetrics};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const STATS_PATH: &str = "/stats;csv;norefresh";
const RAW_CONFIG_PATH: &str = "/v2/services/haproxy/configuration/raw";

/// Column sums from the stats table.
///
/// A column is `None` when the header lacks it or no row carried a parsable
/// value, which keeps "absent" distinct from a genuine zero.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatsTotals {
    pub scur: Option<f64>,
    pub req_tot: Option<f64>,
    pub rate: Option<f64>,
    pub ereq: Option<f64>,
    pub econ: Option<f64>,
    pub eresp: Option<f64>,
    pub rows: usize,
}

impl StatsTotals {
    fn slot(&mut self, column: &str) -> Option<&mut Option<f64>> {
        match column {
            "scur" => Some(&mut self.scur),
            "req_tot" => Some(&mut self.req_tot),
            "rate" => Some(&mut self.rate),
            "ereq" => Some(&mut self.ereq),
            "econ" => Some(&mut self.econ),
            "eresp" => Some(&mut self.eresp),
            _ => None,
        }
    }

    fn into_metrics(self, server_id: &str) -> ServerMetrics {
        let mut metrics = ServerMetrics::empty(server_id);
        metrics.active_connections = self.scur.unwrap_or(0.0) as u64;
        metrics.total_requests = self.req_tot.unwrap_or(0.0) as u64;
        metrics.requests_per_sec = self.rate.unwrap_or(0.0);

        let errors: Option<f64> = [self.ereq, self.econ, self.eresp]
            .into_iter()
            .flatten()
            .reduce(|a, b| a + b);
        if let (Some(errors), Some(total)) = (errors, self.req_tot) {
            if total > 0.0 {
                metrics.error_rate = errors / total;
            }
        }

        for (name, value) in [("ereq", self.ereq), ("econ", self.econ), ("eresp", self.eresp)] {
            if let Some(v) = value {
                metrics.extra.insert(name.to_string(), v);
            }
        }
        metrics
    }
}

const SUMMED_COLUMNS: [&str; 6] = ["scur", "req_tot", "rate", "ereq", "econ", "eresp"];

/// Decode HAProxy's CSV stats table.
///
/// The first non-empty line is the header (leading `# ` stripped). Data rows
/// whose width differs from the header, or that start with `#`, are skipped.
pub fn decode_stats_table(body: &str) -> StatsTotals {
    let mut totals = StatsTotals::default();
    let mut lines = body.lines().map(str::trim_end).filter(|l| !l.is_empty());

    let Some(header) = lines.next() else {
        return totals;
    };
    let header = header.trim_start_matches('#').trim_start();
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let index: HashMap<&str, usize> = columns.iter().enumerate().map(|(i, c)| (*c, i)).collect();

    for line in lines {
        if line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        if cells.len() != columns.len() {
            debug!(expected = columns.len(), got = cells.len(), "Skipping stats row of unexpected width");
            continue;
        }
        totals.rows += 1;

        for column in SUMMED_COLUMNS {
            let Some(&i) = index.get(column) else { continue };
            let Ok(value) = cells[i].trim().parse::<f64>() else { continue };
            if let Some(slot) = totals.slot(column) {
                *slot = Some(slot.unwrap_or(0.0) + value);
            }
        }
    }

    totals
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    data: String,
}

pub struct HaproxyAdapter {
    server_id: String,
    server_name: String,
    api: AdminApi,
}

impl HaproxyAdapter {
    pub(crate) fn new(server_id: String, server_name: String, api: AdminApi) -> Self {
        Self {
            server_id,
            server_name,
            api,
        }
    }

    async fn read_stats(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        let response = self
            .api
            .get("get_metrics", timeout, STATS_PATH)
            .await?
            .ensure_success(STATS_PATH)?;
        Ok(decode_stats_table(&response.body).into_metrics(&self.server_id))
    }
}

#[async_trait]
impl ProxyAdapter for HaproxyAdapter {
    fn family(&self) -> ProxyFamily {
        ProxyFamily::HaProxy
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, AdapterError> {
        self.api.probe(timeout, STATS_PATH).await
    }

    async fn get_metrics(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        degrade_metrics(&self.server_id, ProxyFamily::HaProxy, self.read_stats(timeout).await)
    }

    async fn get_config(&self, timeout: Duration) -> Result<ProxyConfig, AdapterError> {
        let response = self
            .api
            .get("get_config", timeout, RAW_CONFIG_PATH)
            .await?
            .ensure_success(RAW_CONFIG_PATH)?;
        let raw: RawConfiguration = serde_json::from_str(&response.body)
            .map_err(|e| AdapterError::MalformedResponse(format!("haproxy raw configuration: {}", e)))?;

        Ok(ProxyConfig {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            proxy_type: ProxyFamily::HaProxy,
            content: raw.data,
            format: "haproxy".to_string(),
            fetched_at: Utc::now(),
        })
    }

    async fn put_config(&self, _timeout: Duration, _content: &str) -> Result<ConfigValidation, AdapterError> {
        Err(AdapterError::not_supported("haproxy", "put_config"))
    }

    async fn reload(&self, _timeout: Duration) -> Result<(), AdapterError> {
        Err(AdapterError::not_supported("haproxy", "reload"))
    }

    async fn tail_logs(&self, _cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError> {
        Err(AdapterError::not_supported("haproxy", "tail_logs"))
    }
}
