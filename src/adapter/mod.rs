//! Uniform capability set over heterogeneous proxy backends
//!
//! Every backend family implements [`ProxyAdapter`]. Shell-managed families
//! run commands over a pooled remote-shell session; API-managed families talk
//! to the proxy's admin endpoint over HTTP. Callers never see the difference.

mod caddy;
mod haproxy;
mod nginx;
mod stub;
mod traefik;

pub use caddy::CaddyAdapter;
pub use haproxy::{decode_stats_table, HaproxyAdapter, StatsTotals};
pub use nginx::{parse_stub_status, NginxAdapter};
pub use stub::StubAdapter;
pub use traefik::TraefikAdapter;

use crate::error::{with_deadline, AdapterError};
use crate::model::{ConfigValidation, LogLine, ProxyConfig, ProxyFamily, ServerMetrics, ServerStatus};
use crate::transport::LineStream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Lines buffered between the remote tail and the consumer
const LOG_BUFFER: usize = 256;

/// Capabilities every backend family exposes.
///
/// An adapter is bound to one server snapshot and is cheap to build, so
/// callers construct a fresh one per operation.
#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Family this adapter serves
    fn family(&self) -> ProxyFamily;

    /// Reachability probe returning round-trip latency
    async fn ping(&self, timeout: Duration) -> Result<Duration, AdapterError>;

    /// Best-effort metrics snapshot
    async fn get_metrics(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError>;

    /// Raw configuration text and its declared format
    async fn get_config(&self, timeout: Duration) -> Result<ProxyConfig, AdapterError>;

    /// Replace the live configuration if the backend accepts `content`
    async fn put_config(&self, timeout: Duration, content: &str) -> Result<ConfigValidation, AdapterError>;

    /// Gracefully reload the running configuration
    async fn reload(&self, timeout: Duration) -> Result<(), AdapterError>;

    /// Follow the proxy's logs until `cancel` fires or the remote side ends
    async fn tail_logs(&self, cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError>;

    /// Coarse status derived from [`ping`](Self::ping)
    async fn get_status(&self, timeout: Duration) -> ServerStatus {
        match self.ping(timeout).await {
            Ok(_) => ServerStatus::Online,
            Err(_) => ServerStatus::Offline,
        }
    }
}

/// Live log tail.
///
/// A pump task frames remote lines into [`LogLine`]s. Setting the cancel flag
/// to `true`, or dropping its sender, stops the pump and releases the remote
/// process; no line is yielded after cancellation is observed.
pub struct LogStream {
    rx: mpsc::Receiver<LogLine>,
    cancel: watch::Receiver<bool>,
}

impl LogStream {
    pub fn spawn(lines: LineStream, cancel: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        tokio::spawn(pump_lines(lines, tx, cancel.clone()));
        Self { rx, cancel }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }
}

impl Stream for LogStream {
    type Item = LogLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogLine>> {
        if self.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

async fn pump_lines(mut lines: LineStream, tx: mpsc::Sender<LogLine>, mut cancel: watch::Receiver<bool>) {
    let mut seq = 0u64;
    loop {
        if *cancel.borrow() {
            break;
        }
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            _ = tx.closed() => break,
            next = lines.next() => match next {
                Some(Ok(text)) => {
                    seq += 1;
                    if tx.send(LogLine::new(seq, text)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Log tail stream failed");
                    break;
                }
                None => break,
            }
        }
    }
    // Dropping `lines` here terminates the remote command
    debug!(lines = seq, "Log tail finished");
}

/// TCP connect to `host:port`, timing the handshake
pub(crate) async fn tcp_ping(host: &str, port: u16, timeout: Duration) -> Result<Duration, AdapterError> {
    with_deadline("ping", timeout, async {
        let start = Instant::now();
        TcpStream::connect((host, port))
            .await
            .map_err(|e| AdapterError::Transport(format!("connect {}:{}: {}", host, port, e)))?;
        Ok(start.elapsed())
    })
    .await
}

/// Keep a failed metrics read from failing the call. Deadlines still propagate.
pub(crate) fn degrade_metrics(
    server_id: &str,
    family: ProxyFamily,
    result: Result<ServerMetrics, AdapterError>,
) -> Result<ServerMetrics, AdapterError> {
    match result {
        Ok(metrics) => Ok(metrics),
        Err(e @ AdapterError::Timeout { .. }) => Err(e),
        Err(e) => {
            warn!(server_id, family = %family, error = %e, "Metrics unavailable, returning empty snapshot");
            Ok(ServerMetrics::empty(server_id))
        }
    }
}

/// Thin client for a proxy's HTTP admin endpoint
pub(crate) struct AdminApi {
    http: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

/// Status and body of an admin API call
pub(crate) struct ApiResponse {
    pub status: reqwest::StatusCode,
    pub body: String,
}

impl ApiResponse {
    /// Turn a non-2xx answer into a transport error naming the path
    pub fn ensure_success(self, path: &str) -> Result<Self, AdapterError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(AdapterError::Transport(format!(
                "{} returned HTTP {}",
                path,
                self.status.as_u16()
            )))
        }
    }
}

impl AdminApi {
    pub fn new(http: reqwest::Client, base_url: String, token: Option<SecretString>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match self.token {
            Some(ref token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    pub async fn send(
        &self,
        op: &'static str,
        timeout: Duration,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse, AdapterError> {
        with_deadline(op, timeout, async move {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok(ApiResponse { status, body })
        })
        .await
    }

    pub async fn get(&self, op: &'static str, timeout: Duration, path: &str) -> Result<ApiResponse, AdapterError> {
        self.send(op, timeout, self.request(reqwest::Method::GET, path)).await
    }

    /// GET `path` and time it; anything but 2xx counts as unreachable
    pub async fn probe(&self, timeout: Duration, path: &str) -> Result<Duration, AdapterError> {
        let start = Instant::now();
        self.get("ping", timeout, path).await?.ensure_success(path)?;
        Ok(start.elapsed())
    }
}

/// Re-indent a JSON document, failing when it does not parse
pub(crate) fn pretty_json(raw: &str) -> Result<String, AdapterError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| AdapterError::MalformedResponse(format!("invalid JSON: {}", e)))?;
    serde_json::to_string_pretty(&value).map_err(|e| AdapterError::MalformedResponse(e.to_string()))
}
