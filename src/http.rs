//! `/metrics` scrape endpoint of `weftd`.
//!
//! Exposes the command, instance cache, commit and peer counters kept in
//! [`crate::metrics`]. Only started when `[metrics] port` is set.

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::net::TcpListener;

async fn scrape() -> String {
    crate::metrics::gather_metrics()
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(scrape))
}

/// Serve the scrape endpoint on an already bound listener until it fails.
pub async fn serve(listener: TcpListener) {
    if let Err(e) = axum::serve(listener, router()).await {
        tracing::error!(error = %e, "Metrics endpoint stopped");
    }
}

/// Bind `0.0.0.0:port` and serve the scrape endpoint. Bind failures are
/// logged; the node keeps running without metrics.
pub async fn run_http_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            tracing::info!(%addr, "Serving metrics");
            serve(listener).await;
        }
        Err(e) => tracing::error!(%addr, error = %e, "Cannot bind metrics endpoint"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_scrape_lists_weft_counters() {
        crate::metrics::init();
        crate::metrics::record_commit();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("weft_commits_total"));
    }
}
