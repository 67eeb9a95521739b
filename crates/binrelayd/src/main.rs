//! binrelay daemon
//!
//! Usage:
//!   # Standalone mode (default)
//!   binrelayd
//!
//!   # ZooKeeper election, metadata in the ZooKeeper tree
//!   binrelayd --mode zookeeper --node-id node-1 --zk-addrs zk1:2181,zk2:2181,zk3:2181
//!
//!   # etcd election, metadata in MySQL
//!   binrelayd --mode etcd \
//!     --node-id node-1 \
//!     --etcd-endpoints http://etcd1:2379 \
//!     --metadata-backend mysql \
//!     --mysql-url mysql://binrelay:secret@db:3306/binrelay

use binrelay_cluster::{init_metrics, ClusterCoordinator, ElectionEvent};
use binrelayd::Cli;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing with configured log level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner(&cli);

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    init_metrics(cli.metrics_addr()).map_err(|e| anyhow::anyhow!(e))?;

    let coordinator = ClusterCoordinator::new(cli.to_cluster_config()).await?;
    tracing::info!(
        node_id = %coordinator.node_id(),
        machine_index = coordinator.machine_index(),
        "Coordinator ready"
    );

    let events = coordinator.subscribe();
    coordinator.start().await?;
    let watcher = tokio::spawn(log_leadership(events));

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");

    let shutdown_timeout = tokio::time::Duration::from_secs(30);
    match tokio::time::timeout(shutdown_timeout, coordinator.shutdown()).await {
        Ok(Ok(())) => tracing::info!("Coordinator shut down gracefully"),
        Ok(Err(e)) => tracing::error!("Coordinator error during shutdown: {}", e),
        Err(_) => tracing::warn!(
            "Shutdown timed out after {:?}, forcing exit",
            shutdown_timeout
        ),
    }
    watcher.abort();

    tracing::info!("Goodbye!");
    Ok(())
}

async fn log_leadership(mut events: broadcast::Receiver<ElectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ElectionEvent::BecameLeader(generation)) => {
                tracing::info!(generation, "This node is now the active relay");
            }
            Ok(ElectionEvent::LostLeadership) => {
                tracing::warn!("This node lost leadership, standing by");
            }
            Ok(ElectionEvent::NewLeader(leader)) => {
                tracing::info!(%leader, "Observed new leader");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "Leadership log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(cli: &Cli) {
    eprintln!(
        r#"
 _     _                _
| |__ (_)_ __  _ __ ___| | __ _ _   _
| '_ \| | '_ \| '__/ _ \ |/ _` | | | |
| |_) | | | | | | |  __/ | (_| | |_| |
|_.__/|_|_| |_|_|  \___|_|\__,_|\__, |
                                |___/
MySQL binlog relay

  Mode:         {:?}
  Cluster:      {}
  Node ID:      {}
  Data Dir:     {}
  Metadata:     {:?}
"#,
        cli.mode,
        cli.cluster_name,
        cli.node_id.as_deref().unwrap_or("auto"),
        cli.data_dir.display(),
        cli.metadata_backend,
    );
}
