//! NGINX over a pooled remote shell

use super::{tcp_ping, LogStream, ProxyAdapter};
use crate::error::{with_deadline, AdapterError};
use crate::model::{ConfigValidation, ProxyConfig, ProxyFamily, ServerMetrics};
use crate::pool::TransportPool;
use crate::transport::{ShellParams, ShellTransport};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const STATUS_COMMAND: &str = "curl -sf http://127.0.0.1/nginx_status 2>/dev/null \
    || curl -sf http://127.0.0.1:8080/nginx_status 2>/dev/null \
    || echo unavailable";
const CONFIG_COMMAND: &str =
    "cat /etc/nginx/nginx.conf 2>/dev/null || cat /usr/local/etc/nginx/nginx.conf";
const LIVE_CONFIG_PATH: &str = "/etc/nginx/nginx.conf";
const RELOAD_COMMAND: &str = "sudo -n nginx -s reload 2>&1";
const TAIL_COMMAND: &str = "tail -n 0 -F /var/log/nginx/access.log /var/log/nginx/error.log 2>/dev/null";

pub struct NginxAdapter {
    server_id: String,
    server_name: String,
    params: ShellParams,
    pool: Arc<TransportPool>,
    connect_timeout: Duration,
}

impl NginxAdapter {
    pub fn new(
        server_id: String,
        server_name: String,
        params: ShellParams,
        pool: Arc<TransportPool>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            server_id,
            server_name,
            params,
            pool,
            connect_timeout,
        }
    }

    async fn transport(&self, timeout: Duration) -> Result<Arc<dyn ShellTransport>, AdapterError> {
        Ok(self.pool.acquire(&self.server_id, &self.params, timeout).await?)
    }

    /// Run one command to completion, returning its combined output
    async fn run(&self, timeout: Duration, command: &str) -> Result<String, AdapterError> {
        let transport = self.transport(timeout).await?;
        let out = transport.exec(command, None).await?;
        if !out.success() {
            return Err(AdapterError::Transport(format!(
                "remote command exited with {:?}: {}",
                out.exit_code,
                out.output.trim()
            )));
        }
        Ok(out.output)
    }

    async fn stage_and_promote(&self, timeout: Duration, content: &str) -> Result<ConfigValidation, AdapterError> {
        let transport = self.transport(timeout).await?;

        let staged_path = format!("/tmp/proxydeck-nginx-{}.conf", uuid::Uuid::new_v4().simple());
        let staged = shell_words::quote(&staged_path);

        // Phase one: stage and validate; the live file is untouched
        let validate = format!("cat > {staged} && nginx -t -c {staged} 2>&1");
        let out = transport.exec(&validate, Some(content.as_bytes())).await?;
        if !out.success() || out.output.contains("[emerg]") || out.output.contains("failed") {
            let cleanup = format!("rm -f {staged}");
            if let Err(e) = transport.exec(&cleanup, None).await {
                debug!(server_id = %self.server_id, error = %e, "Failed to remove staged config");
            }
            info!(server_id = %self.server_id, "Rejected nginx configuration");
            return Ok(ConfigValidation::invalid(validation_errors(&out.output, out.exit_code)));
        }

        // Phase two: promote the validated file
        let promote = format!("sudo -n cp {staged} {} 2>&1", LIVE_CONFIG_PATH);
        match transport.exec(&promote, None).await {
            Ok(out) if out.success() => {
                info!(server_id = %self.server_id, "Promoted validated nginx configuration");
                Ok(ConfigValidation::valid())
            }
            Ok(out) => Err(AdapterError::PromotionFailed {
                staged_path,
                reason: out.output.trim().to_string(),
            }),
            Err(e) => Err(AdapterError::PromotionFailed {
                staged_path,
                reason: e.to_string(),
            }),
        }
    }
}

fn validation_errors(output: &str, exit_code: Option<i32>) -> Vec<String> {
    let errors: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if errors.is_empty() {
        vec![format!("nginx -t exited with {:?}", exit_code)]
    } else {
        errors
    }
}

#[async_trait]
impl ProxyAdapter for NginxAdapter {
    fn family(&self) -> ProxyFamily {
        ProxyFamily::Nginx
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, AdapterError> {
        tcp_ping(&self.params.host, self.params.port, timeout).await
    }

    async fn get_metrics(&self, timeout: Duration) -> Result<ServerMetrics, AdapterError> {
        let raw = with_deadline("get_metrics", timeout, self.run(timeout, STATUS_COMMAND)).await?;
        let mut metrics = ServerMetrics::empty(&self.server_id);
        parse_stub_status(&raw, &mut metrics);
        Ok(metrics)
    }

    async fn get_config(&self, timeout: Duration) -> Result<ProxyConfig, AdapterError> {
        let content = with_deadline("get_config", timeout, self.run(timeout, CONFIG_COMMAND)).await?;
        Ok(ProxyConfig {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            proxy_type: ProxyFamily::Nginx,
            content,
            format: "nginx".to_string(),
            fetched_at: Utc::now(),
        })
    }

    async fn put_config(&self, timeout: Duration, content: &str) -> Result<ConfigValidation, AdapterError> {
        with_deadline("put_config", timeout, self.stage_and_promote(timeout, content)).await
    }

    async fn reload(&self, timeout: Duration) -> Result<(), AdapterError> {
        with_deadline("reload", timeout, self.run(timeout, RELOAD_COMMAND)).await?;
        info!(server_id = %self.server_id, "Reloaded nginx");
        Ok(())
    }

    async fn tail_logs(&self, cancel: watch::Receiver<bool>) -> Result<LogStream, AdapterError> {
        let transport = self.transport(self.connect_timeout).await?;
        let lines = transport.stream(TAIL_COMMAND).await?;
        debug!(server_id = %self.server_id, "Started nginx log tail");
        Ok(LogStream::spawn(lines, cancel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubSection {
    Preamble,
    CounterRow,
    Done,
}

/// Parse an nginx `stub_status` report into `metrics`:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
///
/// Unrecognized input leaves the snapshot untouched.
pub fn parse_stub_status(raw: &str, metrics: &mut ServerMetrics) {
    let mut section = StubSection::Preamble;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("Active connections:") {
            if let Ok(active) = rest.trim().parse::<u64>() {
                metrics.active_connections = active;
            }
            continue;
        }

        if line.starts_with("server accepts handled requests") {
            section = StubSection::CounterRow;
            continue;
        }

        if section == StubSection::CounterRow {
            let counters: Vec<u64> = line
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            if let &[accepts, handled, requests] = counters.as_slice() {
                metrics.total_requests = requests;
                metrics.extra.insert("accepts".into(), accepts as f64);
                metrics.extra.insert("handled".into(), handled as f64);
                metrics
                    .extra
                    .insert("dropped".into(), accepts.saturating_sub(handled) as f64);
            } else {
                warn!(line, "Unexpected nginx counter row");
            }
            section = StubSection::Done;
            continue;
        }

        if line.starts_with("Reading:") {
            let fields: Vec<&str> = line.split_whitespace().collect();
            for pair in fields.chunks(2) {
                if let [label, value] = pair {
                    if let Ok(v) = value.parse::<f64>() {
                        let key = label.trim_end_matches(':').to_lowercase();
                        metrics.extra.insert(key, v);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::transport::{CommandOutput, Connector, LineStream, TransportError};
    use futures::StreamExt;
    use parking_lot::Mutex;

    const STUB_STATUS: &str = "Active connections: 291 \n\
        server accepts handled requests\n \
        16630948 16630940 31070465 \n\
        Reading: 6 Writing: 179 Waiting: 106 \n";

    #[test]
    fn test_parse_stub_status() {
        let mut metrics = ServerMetrics::empty("s1");
        parse_stub_status(STUB_STATUS, &mut metrics);

        assert_eq!(metrics.active_connections, 291);
        assert_eq!(metrics.total_requests, 31070465);
        assert_eq!(metrics.extra["accepts"], 16630948.0);
        assert_eq!(metrics.extra["dropped"], 8.0);
        assert_eq!(metrics.extra["reading"], 6.0);
        assert_eq!(metrics.extra["writing"], 179.0);
        assert_eq!(metrics.extra["waiting"], 106.0);
    }

    #[test]
    fn test_parse_stub_status_unavailable() {
        let mut metrics = ServerMetrics::empty("s1");
        parse_stub_status("unavailable\n", &mut metrics);
        assert_eq!(metrics.active_connections, 0);
        assert!(metrics.extra.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let errors = validation_errors(
            "nginx: [emerg] unknown directive \"servr\" in /tmp/x.conf:3\n\nnginx: configuration file /tmp/x.conf test failed\n",
            Some(1),
        );
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("[emerg]"));
        assert_eq!(validation_errors("", Some(1)), vec!["nginx -t exited with Some(1)"]);
    }

    /// Scripted shell that records every command it runs
    #[derive(Default)]
    struct ScriptedShell {
        commands: Mutex<Vec<String>>,
        stdin: Mutex<Vec<String>>,
        validate_output: String,
        validate_exit: i32,
        promote_exit: i32,
    }

    #[async_trait]
    impl ShellTransport for ScriptedShell {
        async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError> {
            self.commands.lock().push(command.to_string());
            if let Some(input) = stdin {
                self.stdin.lock().push(String::from_utf8_lossy(input).into_owned());
            }
            let (exit, output) = if command.contains("nginx -t") {
                (self.validate_exit, self.validate_output.clone())
            } else if command.starts_with("sudo -n cp") {
                (self.promote_exit, "cp: permission denied".to_string())
            } else if command.starts_with("cat /etc/nginx") {
                (0, "events {}\n".to_string())
            } else {
                (0, String::new())
            };
            Ok(CommandOutput {
                exit_code: Some(exit),
                output,
            })
        }

        async fn stream(&self, command: &str) -> Result<LineStream, TransportError> {
            self.commands.lock().push(command.to_string());
            let lines = vec![Ok("a".to_string()), Ok("[warn] b".to_string())];
            Ok(Box::pin(futures::stream::iter(lines)))
        }

        async fn probe(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    struct ScriptedConnector(Arc<ScriptedShell>);

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _params: &ShellParams) -> Result<Arc<dyn ShellTransport>, TransportError> {
            Ok(self.0.clone())
        }
    }

    fn adapter(shell: Arc<ScriptedShell>) -> NginxAdapter {
        let pool = TransportPool::new(Arc::new(ScriptedConnector(shell)), PoolConfig::default());
        NginxAdapter::new(
            "s1".into(),
            "edge-1".into(),
            ShellParams {
                host: "127.0.0.1".into(),
                port: 22,
                user: "deploy".into(),
                private_key: None,
            },
            pool,
            Duration::from_secs(5),
        )
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_put_config_valid_promotes() {
        let shell = Arc::new(ScriptedShell {
            validate_output: "nginx: configuration file test is successful".into(),
            ..Default::default()
        });
        let nginx = adapter(shell.clone());

        let result = nginx.put_config(TIMEOUT, "events {}\nhttp {}\n").await.unwrap();
        assert!(result.is_valid);

        let commands = shell.commands.lock();
        let promote = commands.iter().find(|c| c.starts_with("sudo -n cp")).unwrap();
        assert!(promote.ends_with("/etc/nginx/nginx.conf 2>&1"));
        assert_eq!(shell.stdin.lock()[0], "events {}\nhttp {}\n");
    }

    #[tokio::test]
    async fn test_put_config_invalid_never_promotes() {
        let shell = Arc::new(ScriptedShell {
            validate_output: "nginx: [emerg] unexpected end of file\nnginx: configuration file test failed".into(),
            validate_exit: 1,
            ..Default::default()
        });
        let nginx = adapter(shell.clone());

        let result = nginx.put_config(TIMEOUT, "http {").await.unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("[emerg]")));
        assert!(!shell.commands.lock().iter().any(|c| c.starts_with("sudo -n cp")));
    }

    #[tokio::test]
    async fn test_put_config_emerg_with_zero_exit_is_invalid() {
        let shell = Arc::new(ScriptedShell {
            validate_output: "nginx: [emerg] host not found".into(),
            validate_exit: 0,
            ..Default::default()
        });
        let result = adapter(shell.clone()).put_config(TIMEOUT, "x").await.unwrap();
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn test_put_config_promotion_failure() {
        let shell = Arc::new(ScriptedShell {
            validate_output: "syntax is ok".into(),
            promote_exit: 1,
            ..Default::default()
        });
        let err = adapter(shell).put_config(TIMEOUT, "events {}").await.unwrap_err();
        match err {
            AdapterError::PromotionFailed { staged_path, reason } => {
                assert!(staged_path.starts_with("/tmp/proxydeck-nginx-"));
                assert!(reason.contains("permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_config_and_reload() {
        let shell = Arc::new(ScriptedShell::default());
        let nginx = adapter(shell.clone());

        let config = nginx.get_config(TIMEOUT).await.unwrap();
        assert_eq!(config.format, "nginx");
        assert_eq!(config.server_name, "edge-1");
        assert_eq!(config.content, "events {}\n");

        nginx.reload(TIMEOUT).await.unwrap();
        assert!(shell.commands.lock().iter().any(|c| c == RELOAD_COMMAND));
    }

    #[tokio::test]
    async fn test_tail_logs_until_remote_ends() {
        let shell = Arc::new(ScriptedShell::default());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let logs: Vec<_> = adapter(shell).tail_logs(cancel_rx).await.unwrap().collect().await;

        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].seq, 2);
        assert_eq!(logs[1].level, crate::model::LogLevel::Warn);
    }
}
