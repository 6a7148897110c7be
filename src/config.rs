use crate::hub::HubConfig;
use crate::model::{ConnectionKind, ProxyFamily, ServerDescriptor};
use crate::monitor::MonitorConfig;
use crate::pool::PoolConfig;
use crate::service::{OperationTimeouts, StatusPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential encryption
    #[serde(default)]
    pub vault: VaultConfig,

    /// Remote-shell session pool
    #[serde(default)]
    pub pool: PoolSettings,

    /// Observer fan-out
    #[serde(default)]
    pub hub: HubSettings,

    /// Background poller
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Per-operation deadlines
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Managed proxy inventory
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 8090)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    /// Environment variable holding the 64-hex-character key
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Deadline for establishing a new session
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// ssh client binary
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            keepalive_interval_secs: default_keepalive_interval(),
            connect_timeout_secs: default_connect_timeout(),
            ssh_program: default_ssh_program(),
        }
    }
}

impl PoolSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            probe_timeout: self.connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval(),
            read_deadline_secs: default_read_deadline(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl HubSettings {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorSettings {
    /// Run the background poller (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_true")]
    pub collect_metrics: bool,

    #[serde(default = "default_monitor_concurrency")]
    pub concurrency: usize,

    /// Consecutive failed checks before a server is reported offline
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,

    /// Consecutive good checks before a server is reported online again
    #[serde(default = "default_threshold")]
    pub success_threshold: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
            collect_metrics: true,
            concurrency: default_monitor_concurrency(),
            failure_threshold: default_threshold(),
            success_threshold: default_threshold(),
        }
    }
}

impl MonitorSettings {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            collect_metrics: self.collect_metrics,
            concurrency: self.concurrency,
        }
    }

    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutSettings {
    #[serde(default = "default_ping_timeout")]
    pub ping_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub metrics_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub config_secs: u64,

    #[serde(default = "default_put_config_timeout")]
    pub put_config_secs: u64,

    #[serde(default = "default_reload_timeout")]
    pub reload_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ping_secs: default_ping_timeout(),
            metrics_secs: default_read_timeout(),
            config_secs: default_read_timeout(),
            put_config_secs: default_put_config_timeout(),
            reload_secs: default_reload_timeout(),
        }
    }
}

impl TimeoutSettings {
    pub fn operation_timeouts(&self) -> OperationTimeouts {
        OperationTimeouts {
            ping: Duration::from_secs(self.ping_secs),
            metrics: Duration::from_secs(self.metrics_secs),
            config: Duration::from_secs(self.config_secs),
            put_config: Duration::from_secs(self.put_config_secs),
            reload: Duration::from_secs(self.reload_secs),
        }
    }
}

/// One managed server. Secret fields hold vault ciphertext
/// (see `proxydeck seal`).
#[derive(Debug, Deserialize, Clone)]
pub struct ServerEntry {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub host: String,

    /// Management port; 0 picks the family default
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub proxy_type: ProxyFamily,

    #[serde(default)]
    pub connection_type: ConnectionKind,

    pub ssh_user: Option<String>,

    pub ssh_key_enc: Option<String>,

    pub api_url: Option<String>,

    pub api_token_enc: Option<String>,
}

impl From<ServerEntry> for ServerDescriptor {
    fn from(entry: ServerEntry) -> Self {
        ServerDescriptor {
            id: entry.id,
            name: entry.name,
            host: entry.host,
            port: entry.port,
            proxy_type: entry.proxy_type,
            connection_type: entry.connection_type,
            ssh_user: entry.ssh_user,
            ssh_key_enc: entry.ssh_key_enc,
            api_url: entry.api_url,
            api_token_enc: entry.api_token_enc,
        }
    }
}

impl ServerEntry {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("server with empty id".to_string());
        }
        if self.host.trim().is_empty() {
            return Err(format!("server '{}': host must not be empty", self.id));
        }
        if self.proxy_type == ProxyFamily::Nginx && self.connection_type != ConnectionKind::Ssh {
            return Err(format!(
                "server '{}': nginx servers are managed over ssh",
                self.id
            ));
        }
        if let Some(ref url) = self.api_url {
            if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!(
                    "server '{}': api_url must start with http:// or https://",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8090
}

fn default_key_env() -> String {
    "PROXYDECK_ENCRYPTION_KEY".to_string()
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    120
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_read_deadline() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_monitor_concurrency() -> usize {
    8
}

fn default_threshold() -> u32 {
    1
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    10
}

fn default_put_config_timeout() -> u64 {
    30
}

fn default_reload_timeout() -> u64 {
    15
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for server in &self.servers {
            if let Err(e) = server.validate() {
                errors.push(e);
            }
            if !seen.insert(server.id.as_str()) {
                errors.push(format!("duplicate server id '{}'", server.id));
            }
        }

        if self.vault.key_env.trim().is_empty() {
            errors.push("vault.key_env must name an environment variable".to_string());
        }
        if self.hub.queue_capacity == 0 {
            errors.push("hub.queue_capacity must be at least 1".to_string());
        }
        for (name, secs) in [
            ("pool.idle_timeout_secs", self.pool.idle_timeout_secs),
            ("pool.sweep_interval_secs", self.pool.sweep_interval_secs),
            ("pool.keepalive_interval_secs", self.pool.keepalive_interval_secs),
            ("pool.connect_timeout_secs", self.pool.connect_timeout_secs),
            ("hub.ping_interval_secs", self.hub.ping_interval_secs),
            ("hub.read_deadline_secs", self.hub.read_deadline_secs),
            ("hub.write_timeout_secs", self.hub.write_timeout_secs),
            ("monitor.interval_secs", self.monitor.interval_secs),
            ("timeouts.ping_secs", self.timeouts.ping_secs),
            ("timeouts.metrics_secs", self.timeouts.metrics_secs),
            ("timeouts.config_secs", self.timeouts.config_secs),
            ("timeouts.put_config_secs", self.timeouts.put_config_secs),
            ("timeouts.reload_secs", self.timeouts.reload_secs),
        ] {
            if secs == 0 {
                errors.push(format!("{} must be greater than zero", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Server inventory as descriptors
    pub fn server_descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers.iter().cloned().map(ServerDescriptor::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
admin_port = 9000

[pool]
idle_timeout_secs = 300

[hub]
queue_capacity = 64

[monitor]
interval_secs = 15
failure_threshold = 3

[[servers]]
id = "edge-1"
name = "Edge 1"
host = "10.0.0.5"
proxy_type = "nginx"
connection_type = "ssh"
ssh_user = "deploy"
ssh_key_enc = "c2VhbGVk"

[[servers]]
id = "lb-1"
host = "10.0.0.6"
proxy_type = "haproxy"
connection_type = "api"
api_url = "http://10.0.0.6:5555"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.pool.pool_config().idle_timeout, Duration::from_secs(300));
        assert_eq!(config.pool.sweep_interval_secs, 120);
        assert_eq!(config.hub.hub_config().queue_capacity, 64);
        assert_eq!(config.monitor.status_policy().failure_threshold, 3);

        let servers = config.server_descriptors();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].proxy_type, ProxyFamily::Nginx);
        assert_eq!(servers[0].effective_port(), 22);
        assert_eq!(servers[1].api_base_url(), "http://10.0.0.6:5555");
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.vault.key_env, "PROXYDECK_ENCRYPTION_KEY");
        assert_eq!(config.hub.queue_capacity, 256);
        assert_eq!(config.timeouts.operation_timeouts().put_config, Duration::from_secs(30));
        assert!(config.monitor.enabled);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_validation_errors_are_collected() {
        let toml = r#"
[hub]
queue_capacity = 0

[[servers]]
id = "a"
host = "h"

[[servers]]
id = "a"
host = ""

[[servers]]
id = "n"
host = "h"
proxy_type = "nginx"
connection_type = "api"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate server id 'a'"));
        assert!(err.contains("host must not be empty"));
        assert!(err.contains("managed over ssh"));
        assert!(err.contains("queue_capacity"));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let toml = r#"
[pool]
connect_timeout_secs = 0

[hub]
write_timeout_secs = 0

[timeouts]
reload_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pool.connect_timeout_secs must be greater than zero"));
        assert!(err.contains("hub.write_timeout_secs must be greater than zero"));
        assert!(err.contains("timeouts.reload_secs must be greater than zero"));
        assert!(!err.contains("pool.idle_timeout_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nadmin_port = 7000").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.admin_port, 7000);

        assert!(Config::load("/nonexistent/proxydeck.toml").is_err());
    }
}
