//! weftd - a standalone weft node.
//!
//! Usage: `weftd [config.toml] [host:port ...]`. Every extra argument is a
//! peer to connect to after listening.

use std::sync::Arc;

use tracing::{error, info, warn};
use weft::config::Config;
use weft::{ConnectionDescription, LocalNode, http, metrics, telemetry};

fn parse_peer(arg: &str) -> Option<ConnectionDescription> {
    let (host, port) = arg.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some(ConnectionDescription::tcp(host, port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("failed to load {config_path}: {e}");
        e
    })?;
    telemetry::init_subscriber(config.node.log_format);

    // Convention: metrics port 0 disables the HTTP endpoint.
    match config.metrics.port {
        Some(0) | None => info!("Metrics disabled"),
        Some(port) => {
            metrics::init();
            tokio::spawn(http::run_http_server(port));
            info!(port, "Prometheus HTTP server started");
        }
    }

    let node = LocalNode::new(Arc::new(config));
    node.listen()?;
    info!(node = %node.id(), "weftd started");

    for arg in args {
        let Some(description) = parse_peer(&arg) else {
            warn!(peer = %arg, "Expected host:port");
            continue;
        };
        match node.connect_to(&description).await {
            Ok(peer) => info!(peer = %peer.id(), remote = %description, "Peer connected"),
            Err(e) => error!(remote = %description, error = %e, "Cannot connect to peer"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.close().await?;
    Ok(())
}
