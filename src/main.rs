use discoveryd::DiscoveryConfig;
use discoveryd::DiscoveryNode;
use discoveryd::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initializing Logs
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DiscoveryConfig::new()?.validate()?;
    info!(
        node = %config.discovery.node_service_name,
        remote = %format!("{}:{}", config.remote.host, config.remote.port),
        bind = %config.server.bind_address,
        "Starting discovery daemon"
    );

    // Initializing Shutdown Signal
    let shutdown = CancellationToken::new();
    let node = DiscoveryNode::connect(config, &shutdown)?;

    tokio::spawn(graceful_shutdown(shutdown));

    if let Err(e) = node.run().await {
        error!("discovery node stopped: {:?}", e);
        return Err(e);
    }

    info!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(shutdown: CancellationToken) {
    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }

    info!("Shutdown server..");
    shutdown.cancel();
}
