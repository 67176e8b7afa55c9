use dockgate::config::Config;
use dockgate::connection::ListenContext;
use dockgate::listener::ProxyListener;
use dockgate::locator::DockerLocator;
use dockgate::supervisor::{self, Supervisor};
use dockgate::worker::Worker;
use dockgate::{tls, PKG_NAME, VERSION};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::from_sources(config_path.as_deref());

    // Initialize logging
    let debug = config.as_ref().map(|c| c.server.debug).unwrap_or(false);
    let directive = if debug { "dockgate=debug" } else { "dockgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let config = config.map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let worker_id = supervisor::worker_id();
    let workers = config.server.worker_count();
    if worker_id.is_none() {
        print_startup_banner(&config, workers);
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = if worker_id.is_none() && workers > 1 {
        let supervisor = Supervisor::new(workers)?;
        tokio::spawn(supervisor.run(shutdown_rx))
    } else {
        start_worker(&config, shutdown_rx)?
    };

    wait_for_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let grace = supervisor::SHUTDOWN_GRACE_PERIOD + Duration::from_secs(1);
    let _ = tokio::time::timeout(grace, task).await;

    info!(worker = ?worker_id, "Shutdown complete");
    Ok(())
}

/// Bind every configured listener in this process
fn start_worker(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
    let locator = Arc::new(DockerLocator::new(&config.docker.endpoint, config.docker.network.clone())?);
    let worker = Arc::new(Worker::from_config(config, locator));

    let bind: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let http = config.server.http_mappings().map_err(|e| anyhow::anyhow!(e))?;
    let https = config.server.https_mappings().map_err(|e| anyhow::anyhow!(e))?;

    let tls_acceptor = if https.is_empty() {
        None
    } else {
        Some(tls::build_acceptor(
            config.server.tls_cert.as_deref(),
            config.server.tls_key.as_deref(),
        )?)
    };

    let mut handles = Vec::new();
    for mapping in http {
        let context = ListenContext { mapping, https: false };
        let listener = ProxyListener::new(SocketAddr::new(bind, mapping.listen), context, Arc::clone(&worker));
        handles.push(tokio::spawn(listener.run(shutdown_rx.clone())));
    }
    if let Some(acceptor) = tls_acceptor {
        for mapping in https {
            let context = ListenContext { mapping, https: true };
            let listener = ProxyListener::new(SocketAddr::new(bind, mapping.listen), context, Arc::clone(&worker))
                .with_tls(acceptor.clone());
            handles.push(tokio::spawn(listener.run(shutdown_rx.clone())));
        }
    }

    Ok(tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
    }))
}

async fn wait_for_signal() {
    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, workers: usize) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        http_ports = %config.server.http_ports,
        https_ports = %config.server.https_ports,
        tls_cert = ?config.server.tls_cert,
        workers,
        "Server configuration"
    );
    info!(
        enabled = config.cache.dir.is_some(),
        dir = ?config.cache.dir,
        max_age_secs = config.cache.max_age_secs,
        max_file_size = config.cache.max_file_size,
        "Response cache settings"
    );
    info!(
        client_max_body_size = config.proxy.client_max_body_size,
        connect_timeout_secs = config.proxy.connect_timeout_secs,
        header_timeout_secs = config.proxy.header_timeout_secs,
        "Request handling settings"
    );
    info!(
        endpoint = %config.docker.endpoint,
        network = ?config.docker.network,
        route_ttl_secs = config.docker.route_ttl_secs,
        static_routes = config.routes.len(),
        "Backend resolution settings"
    );
}
