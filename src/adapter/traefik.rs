//! Traefik through its read-only API

use super::{degrade_metrics, pretty_json, AdminApi, LogStream, ProxyAdapter};
use crate::error::AdapterError;
use crate::model::{ConfigValidation, ProxyConfig, ProxyFamily, ServerMetrics};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Default, Deserialize)]
struct Overview {
    #[serde(default)]
    http: ProtocolOverview,
    #[serde(default)]
    tcp: ProtocolOverview,
    #[serde(default)]
    udp: ProtocolOverview,
}

#[derive(Debug, Default, Deserialize)]
struct ProtocolOverview {
    #[serde(default)]
    routers: SectionCount,
    #[serde(default)]
    services: SectionCount,
    #[serde(default)]
    middlewares: SectionCount,
}

#[derive(Debug, Default, Deserialize)]
struct SectionCount {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    warnings: u64,
    #[serde(default)]
    errors: u64,
}

pub struct TraefikAdapter {
    server_id: String,
    server_name: String,
    api: AdminApi,
}

impl TraefikAdapter {
    pub(crate) fn new(server_id: String, server_name: String, api: AdminApi) -> Self {
        Self {
            server_id,
            server_name,
            api,
        }
    }

    async fn read_overview(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        let path = "/api/overview";
        let response = self.api.get("get_metrics", timeout, path).await?.ensure_success(path)?;
        let overview: Overview = serde_json::from_str(&response.body)
            .map_err(|e| AdapterError::MalformedResponse(format!("traefik overview: {}", e)))?;

        let mut metrics = ServerMetrics::empty(&self.server_id);
        let sections = [
            ("routers", &overview.http.routers),
            ("services", &overview.http.services),
            ("middlewares", &overview.http.middlewares),
            ("tcp_routers", &overview.tcp.routers),
            ("tcp_services", &overview.tcp.services),
            ("udp_routers", &overview.udp.routers),
            ("udp_services", &overview.udp.services),
        ];

        let (mut warnings, mut errors) = (0, 0);
        for (name, count) in sections {
            metrics.extra.insert(name.to_string(), count.total as f64);
            warnings += count.warnings;
            errors += count.errors;
        }
        metrics.extra.insert("warnings".into(), warnings as f64);
        metrics.extra.insert("errors".into(), errors as f64);

        Ok(metrics)
    }
}

#[async_trait]
impl ProxyAdapter for TraefikAdapter {
    fn family(&self) -> ProxyFamily {
        ProxyFamily::Traefik
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, AdapterError> {
        self.api.probe(timeout, "/ping").await
    }

    async fn get_metrics(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        degrade_metrics(&self.server_id, ProxyFamily::Traefik, self.read_overview(timeout).await)
    }

    async fn get_config(&self, timeout: Duration) -> Result<ProxyConfig, AdapterError> {
        let path = "/api/rawdata";
        let response = self.api.get("get_config", timeout, path).await?.ensure_success(path)?;
        Ok(ProxyConfig {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            proxy_type: ProxyFamily::Traefik,
            content: pretty_json(&response.body)?,
            format: "json".to_string(),
            fetched_at: Utc::now(),
        })
    }

    async fn put_config(&self, _timeout: Duration, _content: &str) -> Result<ConfigValidation, AdapterError> {
        Err(AdapterError::not_supported("traefik", "put_config"))
    }

    async fn reload(&self, _timeout: Duration) -> Result<(), AdapterError> {
        Err(AdapterError::not_supported("traefik", "reload"))
    }

    async fn tail_logs(&self, _cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError> {
        Err(AdapterError::not_supported("traefik", "tail_logs"))
    }
}
