//! Shared data types for servers, metrics, configs, logs and alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reverse-proxy software running on a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyFamily {
    Nginx,
    Traefik,
    Caddy,
    #[serde(rename = "haproxy")]
    HaProxy,
    #[default]
    #[serde(other)]
    Other,
}

impl ProxyFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyFamily::Nginx => "nginx",
            ProxyFamily::Traefik => "traefik",
            ProxyFamily::Caddy => "caddy",
            ProxyFamily::HaProxy => "haproxy",
            ProxyFamily::Other => "other",
        }
    }

    /// Conventional management port when a server record omits one
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyFamily::Nginx => 22,
            ProxyFamily::Traefik => 8080,
            ProxyFamily::Caddy => 2019,
            ProxyFamily::HaProxy => 9090,
            ProxyFamily::Other => 80,
        }
    }
}

impl std::fmt::Display for ProxyFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the dashboard reaches a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Ssh,
    Api,
}

/// Immutable snapshot of a server's connection parameters.
///
/// Secret fields hold vault ciphertext, never plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub proxy_type: ProxyFamily,
    #[serde(default)]
    pub connection_type: ConnectionKind,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing)]
    pub ssh_key_enc: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_token_enc: Option<String>,
}

impl ServerDescriptor {
    /// Port to use, falling back to the family default when unset
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.proxy_type.default_port()
        } else {
            self.port
        }
    }

    /// Admin API base URL without trailing slash
    pub fn api_base_url(&self) -> String {
        match self.api_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.effective_port()),
        }
    }

    /// Name used in logs and config payloads
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Coarse reachability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
    Unknown,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Unknown => "unknown",
        }
    }
}

/// Best-effort metrics snapshot. Fields a family cannot report stay zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub requests_per_sec: f64,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub p50_latency: f64,
    #[serde(default)]
    pub p95_latency: f64,
    #[serde(default)]
    pub p99_latency: f64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub mem_usage: f64,
    #[serde(default)]
    pub network_in: f64,
    #[serde(default)]
    pub network_out: f64,
    /// Family-specific counters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl ServerMetrics {
    /// Empty snapshot stamped with the current time
    pub fn empty(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            requests_per_sec: 0.0,
            active_connections: 0,
            total_requests: 0,
            error_rate: 0.0,
            p50_latency: 0.0,
            p95_latency: 0.0,
            p99_latency: 0.0,
            cpu_usage: 0.0,
            mem_usage: 0.0,
            network_in: 0.0,
            network_out: 0.0,
            extra: BTreeMap::new(),
        }
    }
}

/// Raw configuration text fetched from a proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub server_id: String,
    pub server_name: String,
    pub proxy_type: ProxyFamily,
    pub content: String,
    pub format: String,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of a configuration write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValidation {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// Severity inferred from a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Case-insensitive keyword match over the raw line
    pub fn infer(line: &str) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("error") || lower.contains("crit") || lower.contains("emerg") {
            LogLevel::Error
        } else if lower.contains("warn") {
            LogLevel::Warn
        } else if lower.contains("debug") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

/// One line of a live log tail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub seq: u64,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(seq: u64, message: String) -> Self {
        Self {
            seq,
            level: LogLevel::infer(&message),
            message,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

/// Alert record as handed over by storage after insertion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub severity: AlertSeverity,
    #[serde(default = "default_alert_status")]
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

fn default_alert_status() -> String {
    "active".to_string()
}
