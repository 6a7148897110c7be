use proxydeck::admin::{AdminServer, PKG_NAME, VERSION};
use proxydeck::config::Config;
use proxydeck::factory::AdapterFactory;
use proxydeck::hub::EventHub;
use proxydeck::monitor::FleetMonitor;
use proxydeck::pool::TransportPool;
use proxydeck::service::{FleetService, InMemoryDirectory, ServerDirectory};
use proxydeck::transport::OpenSshConnector;
use proxydeck::vault::CredentialVault;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxydeck=debug".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("keygen") => {
            println!("{}", CredentialVault::generate_key_hex());
            return Ok(());
        }
        Some("seal") => {
            let config = load_config(args.get(1).map(PathBuf::from).unwrap_or_else(default_config_path))?;
            return seal_stdin(&config);
        }
        Some("--version") | Some("-V") => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        _ => {}
    }

    let config_path = args.first().map(PathBuf::from).unwrap_or_else(default_config_path);
    let config = load_config(config_path.clone())?;

    print_startup_banner(&config);

    let vault = Arc::new(CredentialVault::from_env(&config.vault.key_env).map_err(|e| {
        error!(env = %config.vault.key_env, error = %e, "Failed to load encryption key");
        anyhow::anyhow!("Failed to load encryption key from {}: {}", config.vault.key_env, e)
    })?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let connector = OpenSshConnector::with_program(&config.pool.ssh_program, config.pool.connect_timeout())?;
    let pool_config = config.pool.pool_config();
    info!(
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        keepalive_secs = pool_config.keepalive_interval.as_secs(),
        "Transport pool configured"
    );
    let pool = TransportPool::new(Arc::new(connector), pool_config);
    let sweeper = pool.start_sweeper(shutdown_rx.clone());

    let http = reqwest::Client::builder()
        .connect_timeout(config.pool.connect_timeout())
        .build()?;
    let factory = AdapterFactory::new(vault, Arc::clone(&pool), http, config.pool.connect_timeout());

    let directory = Arc::new(InMemoryDirectory::new(config.server_descriptors()));
    let hub = EventHub::new(config.hub.hub_config());
    let service = FleetService::new(
        Arc::clone(&directory) as Arc<dyn ServerDirectory>,
        factory,
        hub,
        config.timeouts.operation_timeouts(),
        config.monitor.status_policy(),
    );

    let monitor_handle = if config.monitor.enabled {
        let monitor = FleetMonitor::new(
            Arc::clone(&service),
            config.monitor.monitor_config(),
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(monitor.run()))
    } else {
        info!("Fleet monitor disabled");
        None
    };

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;
    let admin_server = AdminServer::new(admin_addr, Arc::clone(&service), shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or inventory reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading server inventory...");
                    reload_inventory(&config_path, &directory, &service).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Closing pooled sessions...");
    pool.shutdown().await;

    // Wait for background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = sweeper.await;
        if let Some(handle) = monitor_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn default_config_path() -> PathBuf {
    PathBuf::from("proxydeck.toml")
}

fn load_config(path: PathBuf) -> anyhow::Result<Config> {
    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), servers = config.servers.len(), "Configuration loaded");
    Ok(config)
}

/// Encrypt a secret read from stdin for use in `ssh_key_enc` / `api_token_enc`
fn seal_stdin(config: &Config) -> anyhow::Result<()> {
    let vault = CredentialVault::from_env(&config.vault.key_env)?;
    let mut secret = String::new();
    std::io::stdin().read_to_string(&mut secret)?;
    let secret = secret.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        anyhow::bail!("Nothing to seal: stdin was empty");
    }
    println!("{}", vault.encrypt(secret)?);
    Ok(())
}

async fn reload_inventory(path: &Path, directory: &InMemoryDirectory, service: &FleetService) {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration, keeping current inventory");
            return;
        }
    };

    let diff = directory.replace_all(config.server_descriptors());
    for server_id in diff.stale() {
        service.invalidate(server_id).await;
    }
    info!(
        added = diff.added.len(),
        removed = diff.removed.len(),
        updated = diff.updated.len(),
        "Server inventory reloaded"
    );
    if !diff.removed.is_empty() {
        warn!(servers = ?diff.removed, "Servers removed from inventory");
    }
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!("  Admin API:  {}:{}", config.server.bind, config.server.admin_port);
    info!("  Servers:    {}", config.servers.len());
    for server in &config.servers {
        info!("    - {} ({}, {})", server.id, server.proxy_type, server.host);
    }
    info!(
        "  Monitor:    {}",
        if config.monitor.enabled {
            format!("every {}s", config.monitor.interval_secs)
        } else {
            "disabled".to_string()
        }
    );
    info!("========================================");
}
