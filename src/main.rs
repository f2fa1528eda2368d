use napgate::config::Config;
use napgate::pool::{ConnectionPool, PoolConfig};
use napgate::proxy::{Gateway, ProxyServer};
use napgate::reaper::Reaper;
use napgate::registry::Registry;
use napgate::runtime::{DockerRuntime, SharedRuntime};
use napgate::sync::Synchronizer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("napgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Connect to the container runtime. Connection construction is lazy in
    // the Docker client; the synchronizer probes reachability and retries,
    // so an unreachable daemon here is not fatal.
    let runtime: SharedRuntime =
        Arc::new(DockerRuntime::connect(config.docker.host.as_deref()).await?);

    let registry = Arc::new(Registry::new());

    // Spawn the container synchronizer (initial scan + event watch)
    let synchronizer = Synchronizer::new(
        Arc::clone(&runtime),
        Arc::clone(&registry),
        config.sleep.reconnect_backoff(),
        shutdown_rx.clone(),
    );
    let sync_handle = tokio::spawn(synchronizer.run());

    // Spawn the idle reaper
    let reaper = Reaper::new(
        Arc::clone(&runtime),
        Arc::clone(&registry),
        config.sleep.idle_threshold(),
        config.sleep.stop_grace(),
        shutdown_rx.clone(),
    );
    let reap_interval = config.sleep.reap_interval();
    let reaper_handle = tokio::spawn(reaper.run(reap_interval));

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let pool = Arc::new(ConnectionPool::new(config.server.upstream, pool_config));

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&registry),
        Arc::clone(&runtime),
        config.server.upstream,
        config.sleep.settle_wait(),
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        bind_addr,
        gateway,
        pool,
        config.server.read_write_timeout(),
        shutdown_rx.clone(),
    );

    let proxy_handle = tokio::spawn(proxy.run());

    // Wait for shutdown signal or a fatal proxy error (bind failure)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            result = proxy_handle => {
                match result {
                    Ok(Err(e)) => {
                        error!(error = %e, "Proxy server error");
                        return Err(e);
                    }
                    Ok(Ok(())) => {}
                    Err(e) => {
                        error!(error = %e, "Proxy server task panicked");
                        return Err(e.into());
                    }
                }
                return Ok(());
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            result = proxy_handle => {
                match result {
                    Ok(Err(e)) => {
                        error!(error = %e, "Proxy server error");
                        return Err(e);
                    }
                    Ok(Ok(())) => {}
                    Err(e) => {
                        error!(error = %e, "Proxy server task panicked");
                        return Err(e.into());
                    }
                }
                return Ok(());
            }
        }
    }

    // Signal shutdown and wait for background tasks (with timeout)
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = sync_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        upstream = %config.server.upstream,
        read_write_timeout_secs = config.server.read_write_timeout_secs,
        "Server configuration"
    );
    info!(
        idle_threshold_secs = config.sleep.idle_threshold_secs,
        reap_interval_secs = config.sleep.reap_interval().as_secs(),
        stop_grace_secs = config.sleep.stop_grace_secs,
        settle_wait_secs = config.sleep.settle_wait_secs,
        "Sleep settings"
    );
    info!(
        docker_host = ?config.docker.host,
        "Container runtime"
    );
}
