//! Remote-shell transports
//!
//! A [`ShellTransport`] is one live, multiplexed shell session to a server.
//! The production implementation drives an OpenSSH control master: a single
//! authenticated `ssh -M` process owns the network connection, and every
//! command runs as a lightweight channel over its control socket.

use async_trait::async_trait;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Interval between control-socket checks while a master is negotiating
const MASTER_POLL_INTERVAL_MS: u64 = 100;
/// Buffered lines between a streaming command and its consumer
const STREAM_BUFFER: usize = 256;

/// Errors from remote-shell sessions
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("ssh connection failed: {0}")]
    Connect(String),

    #[error("session is closed")]
    Closed,

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters needed to open a session. The private key is decrypted and
/// lives only as long as this value.
pub struct ShellParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: Option<SecretString>,
}

impl ShellParams {
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

impl std::fmt::Debug for ShellParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Result of a completed remote command. `output` is stdout followed by stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Lines produced by a long-running remote command
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One live remote-shell session
#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Run a command to completion, optionally feeding `stdin`
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError>;

    /// Start a long-running command and stream its combined output.
    /// Dropping the stream terminates the remote command.
    async fn stream(&self, command: &str) -> Result<LineStream, TransportError>;

    /// Trivial no-op round trip proving the session is alive
    async fn probe(&self) -> Result<(), TransportError>;

    /// Close the session and release the underlying connection
    async fn close(&self);
}

/// Negotiates new sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ShellParams) -> Result<Arc<dyn ShellTransport>, TransportError>;
}

/// Connector backed by the system `ssh` client in control-master mode
pub struct OpenSshConnector {
    ssh_program: String,
    control_dir: tempfile::TempDir,
    connect_timeout: Duration,
}

impl OpenSshConnector {
    pub fn new(connect_timeout: Duration) -> std::io::Result<Self> {
        Self::with_program("ssh", connect_timeout)
    }

    pub fn with_program(program: &str, connect_timeout: Duration) -> std::io::Result<Self> {
        let control_dir = tempfile::Builder::new().prefix("proxydeck-ssh-").tempdir()?;
        Ok(Self {
            ssh_program: program.to_string(),
            control_dir,
            connect_timeout,
        })
    }

    /// Write the private key to a 0600 temporary file for `ssh -i`.
    /// The file is deleted when the returned handle drops.
    fn write_identity(key: &SecretString) -> std::io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new().prefix("id-").tempfile()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        let pem = key.expose_secret();
        file.write_all(pem.as_bytes())?;
        if !pem.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, params: &ShellParams) -> Result<Arc<dyn ShellTransport>, TransportError> {
        let identity = params
            .private_key
            .as_ref()
            .map(Self::write_identity)
            .transpose()?;

        let control_path = self
            .control_dir
            .path()
            .join(format!("{}.sock", uuid::Uuid::new_v4().simple()));
        let destination = params.destination();

        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&control_path)
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ServerAliveInterval=15"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(params.port.to_string());
        if let Some(ref file) = identity {
            cmd.arg("-i").arg(file.path()).args(["-o", "IdentitiesOnly=yes"]);
        }
        cmd.arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %params.host, port = params.port, "Negotiating SSH control master");
        let mut master = cmd.spawn()?;

        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        loop {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(TransportError::Connect(format!(
                    "ssh exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }

            if control_check(&self.ssh_program, &control_path, &destination).await {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(TransportError::Timeout(self.connect_timeout));
            }

            tokio::time::sleep(Duration::from_millis(MASTER_POLL_INTERVAL_MS)).await;
        }

        // Authenticated; the key file is no longer needed
        drop(identity);

        info!(host = %params.host, port = params.port, "SSH control master established");

        Ok(Arc::new(OpenSshSession {
            ssh_program: self.ssh_program.clone(),
            control_path,
            destination,
            port: params.port,
            master: parking_lot::Mutex::new(Some(master)),
        }))
    }
}

async fn control_check(program: &str, control_path: &Path, destination: &str) -> bool {
    Command::new(program)
        .arg("-S")
        .arg(control_path)
        .args(["-O", "check"])
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A session multiplexed over an OpenSSH control socket
struct OpenSshSession {
    ssh_program: String,
    control_path: PathBuf,
    destination: String,
    port: u16,
    master: parking_lot::Mutex<Option<Child>>,
}

impl OpenSshSession {
    fn is_closed(&self) -> bool {
        self.master.lock().is_none()
    }

    /// Build a client command that rides the existing master only
    fn remote_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no"])
            .args(["-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.destination)
            .arg("--")
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ShellTransport for OpenSshSession {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut cmd = self.remote_command(command);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let out = child.wait_with_output().await?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(CommandOutput {
            exit_code: out.status.code(),
            output,
        })
    }

    async fn stream(&self, command: &str) -> Result<LineStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut cmd = self.remote_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Box::pin(ProcessLines { _child: child, rx }))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let out = self.exec("true", None).await?;
        if out.success() {
            Ok(())
        } else {
            Err(TransportError::Connect(format!(
                "liveness probe failed: {}",
                out.output.trim()
            )))
        }
    }

    async fn close(&self) {
        let master = self.master.lock().take();
        let Some(mut master) = master else {
            return;
        };

        let exit = Command::new(&self.ssh_program)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        if let Err(e) = exit {
            warn!(error = %e, "Failed to request SSH master exit");
        }

        let _ = master.kill().await;
        let _ = std::fs::remove_file(&self.control_path);
        debug!(destination = %self.destination, "SSH session closed");
    }
}

/// Forward lines from one pipe into the shared channel until EOF or until the
/// consumer goes away
async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<Result<String, TransportError>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    if tx.send(Ok(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(TransportError::Io(e))).await;
                    break;
                }
            }
        }
    }
}

/// Output of a streaming command. Holding the child keeps the remote command
/// alive; dropping this kills it.
struct ProcessLines {
    _child: Child,
    rx: mpsc::Receiver<Result<String, TransportError>>,
}

impl Stream for ProcessLines {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
