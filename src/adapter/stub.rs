//! Fallback for backends with no dedicated integration

use super::{tcp_ping, LogStream, ProxyAdapter};
use crate::error::AdapterError;
use crate::model::{ConfigValidation, ProxyConfig, ProxyFamily, ServerMetrics};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// Reachability only: ping is a TCP connect, metrics an empty snapshot
pub struct StubAdapter {
    server_id: String,
    host: String,
    port: u16,
}

impl StubAdapter {
    pub fn new(server_id: String, host: String, port: u16) -> Self {
        Self { server_id, host, port }
    }
}

#[async_trait]
impl ProxyAdapter for StubAdapter {
    fn family(&self) -> ProxyFamily {
        ProxyFamily::Other
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, AdapterError> {
        tcp_ping(&self.host, self.port, timeout).await
    }

    async fn get_metrics(&self, _timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        Ok(ServerMetrics::empty(&self.server_id))
    }

    async fn get_config(&self, _timeout: Duration) -> Result<ProxyConfig, AdapterError> {
        Err(AdapterError::not_supported("other", "get_config"))
    }

    async fn put_config(&self, _timeout: Duration, _content: &str) -> Result<ConfigValidation, AdapterError> {
        Err(AdapterError::not_supported("other", "put_config"))
    }

    async fn reload(&self, _timeout: Duration) -> Result<(), AdapterError> {
        Err(AdapterError::not_supported("other", "reload"))
    }

    async fn tail_logs(&self, _cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError> {
        Err(AdapterError::not_supported("other", "tail_logs"))
    }
}
