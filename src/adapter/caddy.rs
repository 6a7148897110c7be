//! Caddy through its admin API

use super::{degrade_metrics, pretty_json, AdminApi, LogStream, ProxyAdapter};
use crate::error::AdapterError;
use crate::model::{ConfigValidation, ProxyConfig, ProxyFamily, ServerMetrics};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const CONFIG_PATH: &str = "/config/";
const LOAD_PATH: &str = "/load";
const METRICS_PATH: &str = "/metrics";

pub struct CaddyAdapter {
    server_id: String,
    server_name: String,
    api: AdminApi,
}

impl CaddyAdapter {
    pub(crate) fn new(server_id: String, server_name: String, api: AdminApi) -> Self {
        Self {
            server_id,
            server_name,
            api,
        }
    }

    async fn read_metrics(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        let response = self
            .api
            .get("get_metrics", timeout, METRICS_PATH)
            .await?
            .ensure_success(METRICS_PATH)?;
        let samples = sum_prometheus_samples(&response.body);

        let mut metrics = ServerMetrics::empty(&self.server_id);
        if let Some(in_flight) = samples.get("caddy_http_requests_in_flight") {
            metrics.active_connections = *in_flight as u64;
        }
        if let Some(total) = samples.get("caddy_http_requests_total") {
            metrics.total_requests = *total as u64;
        }
        if let Some(errors) = samples.get("caddy_http_request_errors_total") {
            metrics.extra.insert("errors".into(), *errors);
            if metrics.total_requests > 0 {
                metrics.error_rate = errors / metrics.total_requests as f64;
            }
        }
        if let Some(rss) = samples.get("process_resident_memory_bytes") {
            metrics.extra.insert("resident_memory_bytes".into(), *rss);
        }
        Ok(metrics)
    }

    async fn post_config(
        &self,
        op: &'static str,
        timeout: Duration,
        body: String,
        force: bool,
    ) -> Result<super::ApiResponse, AdapterError> {
        let mut request = self
            .api
            .request(Method::POST, LOAD_PATH)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if force {
            request = request.header(CACHE_CONTROL, "must-revalidate");
        }
        self.api.send(op, timeout, request).await
    }
}

/// Sum every sample of each metric family in a Prometheus text exposition,
/// ignoring labels
fn sum_prometheus_samples(text: &str) -> HashMap<String, f64> {
    let mut sums = HashMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (series, rest) = match line.find('{') {
            Some(brace) => match line[brace..].find('}') {
                Some(close) => (&line[..brace], &line[brace + close + 1..]),
                None => continue,
            },
            None => match line.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest),
                None => continue,
            },
        };
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        if value.is_finite() {
            *sums.entry(series.to_string()).or_insert(0.0) += value;
        }
    }
    sums
}

#[async_trait]
impl ProxyAdapter for CaddyAdapter {
    fn family(&self) -> ProxyFamily {
        ProxyFamily::Caddy
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, AdapterError> {
        self.api.probe(timeout, CONFIG_PATH).await
    }

    async fn get_metrics(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        degrade_metrics(&self.server_id, ProxyFamily::Caddy, self.read_metrics(timeout).await)
    }

    async fn get_config(&self, timeout: Duration) -> Result<ProxyConfig, AdapterError> {
        let response = self
            .api
            .get("get_config", timeout, CONFIG_PATH)
            .await?
            .ensure_success(CONFIG_PATH)?;
        Ok(ProxyConfig {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            proxy_type: ProxyFamily::Caddy,
            content: pretty_json(&response.body)?,
            format: "json".to_string(),
            fetched_at: Utc::now(),
        })
    }

    async fn put_config(&self, timeout: Duration, content: &str) -> Result<ConfigValidation, AdapterError> {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(content) {
            return Ok(ConfigValidation::invalid(vec![format!("invalid JSON: {}", e)]));
        }

        // Caddy validates and applies /load atomically
        let response = self.post_config("put_config", timeout, content.to_string(), false).await?;
        if !response.status.is_success() {
            let detail = response.body.trim();
            let message = if detail.is_empty() {
                format!("caddy returned HTTP {}", response.status.as_u16())
            } else {
                format!("caddy returned HTTP {}: {}", response.status.as_u16(), detail)
            };
            return Ok(ConfigValidation::invalid(vec![message]));
        }

        info!(server_id = %self.server_id, "Loaded new caddy configuration");
        Ok(ConfigValidation::valid())
    }

    async fn reload(&self, timeout: Duration) -> Result<(), AdapterError> {
        let current = self
            .api
            .get("reload", timeout, CONFIG_PATH)
            .await?
            .ensure_success(CONFIG_PATH)?;
        self.post_config("reload", timeout, current.body, true)
            .await?
            .ensure_success(LOAD_PATH)?;
        info!(server_id = %self.server_id, "Reloaded caddy");
        Ok(())
    }

    async fn tail_logs(&self, _cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError> {
        Err(AdapterError::not_supported("caddy", "tail_logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn adapter(base_url: String) -> CaddyAdapter {
        CaddyAdapter::new(
            "c1".into(),
            "edge-caddy".into(),
            AdminApi::new(reqwest::Client::new(), base_url, None),
        )
    }

    const EXPOSITION: &str = "\
# HELP caddy_http_requests_in_flight Number of requests currently handled by this server.
# TYPE caddy_http_requests_in_flight gauge
caddy_http_requests_in_flight{handler=\"reverse_proxy\",server=\"srv0\"} 3
caddy_http_requests_in_flight{handler=\"file_server\",server=\"srv0\"} 1
caddy_http_requests_total{handler=\"reverse_proxy\",server=\"srv0\"} 1200
caddy_http_request_errors_total{handler=\"reverse_proxy\",server=\"srv0\"} 12
process_resident_memory_bytes 4.2e+07
go_gc_duration_seconds{quantile=\"NaN\"} NaN
";

    #[test]
    fn test_sum_prometheus_samples() {
        let sums = sum_prometheus_samples(EXPOSITION);
        assert_eq!(sums["caddy_http_requests_in_flight"], 4.0);
        assert_eq!(sums["caddy_http_requests_total"], 1200.0);
        assert_eq!(sums["process_resident_memory_bytes"], 42_000_000.0);
        assert!(!sums.contains_key("go_gc_duration_seconds"));
    }

    #[tokio::test]
    async fn test_metrics_from_exposition() {
        let base = mock::serve(|req| match req.path.as_str() {
            "/metrics" => (200, EXPOSITION.to_string()),
            _ => (404, String::new()),
        })
        .await;

        let metrics = adapter(base).get_metrics(TIMEOUT).await.unwrap();
        assert_eq!(metrics.active_connections, 4);
        assert_eq!(metrics.total_requests, 1200);
        assert!((metrics.error_rate - 0.01).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_put_config_rejects_invalid_json_locally() {
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        let base = mock::serve(move |_| {
            *counter.lock() += 1;
            (200, String::new())
        })
        .await;

        let result = adapter(base).put_config(TIMEOUT, "{not json").await.unwrap();
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("invalid JSON"));
        assert_eq!(*hits.lock(), 0);
    }

    #[tokio::test]
    async fn test_put_config_reports_caddy_rejection() {
        let base = mock::serve(|req| match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/load") => (400, r#"{"error":"loading config: unknown module"}"#.into()),
            _ => (404, String::new()),
        })
        .await;

        let result = adapter(base).put_config(TIMEOUT, r#"{"apps":{}}"#).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("HTTP 400"));
        assert!(result.errors[0].contains("unknown module"));
    }

    #[tokio::test]
    async fn test_put_config_applies_valid_json() {
        let loaded = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&loaded);
        let base = mock::serve(move |req| {
            if req.path == "/load" {
                *sink.lock() = req.body;
            }
            (200, String::new())
        })
        .await;

        let result = adapter(base).put_config(TIMEOUT, r#"{"apps":{}}"#).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(*loaded.lock(), r#"{"apps":{}}"#);
    }

    #[tokio::test]
    async fn test_reload_reposts_current_config() {
        let forced = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&forced);
        let base = mock::serve(move |req| match (req.method.as_str(), req.path.as_str()) {
            ("GET", "/config/") => (200, r#"{"apps":{"http":{}}}"#.into()),
            ("POST", "/load") => {
                let cache = req
                    .headers
                    .get("cache-control")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *seen.lock() = Some((cache, req.body));
                (200, String::new())
            }
            _ => (404, String::new()),
        })
        .await;

        adapter(base).reload(TIMEOUT).await.unwrap();
        let (cache, body) = forced.lock().clone().unwrap();
        assert_eq!(cache.as_deref(), Some("must-revalidate"));
        assert_eq!(body, r#"{"apps":{"http":{}}}"#);
    }

    #[tokio::test]
    async fn test_get_config_pretty_prints() {
        let base = mock::serve(|_| (200, r#"{"apps":{"http":{"servers":{}}}}"#.into())).await;
        let config = adapter(base).get_config(TIMEOUT).await.unwrap();
        assert_eq!(config.format, "json");
        assert!(config.content.starts_with("{\n  \"apps\""));
    }
}
