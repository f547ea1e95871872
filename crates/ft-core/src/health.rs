//! Local origin health check

use std::time::Duration;
use tokio::net::TcpStream;

use crate::config::DEFAULT_HEALTH_TIMEOUT;

/// Check whether something accepts TCP connections on `localhost:port`
pub async fn health_check(port: u16) -> bool {
    health_check_with_timeout(port, DEFAULT_HEALTH_TIMEOUT).await
}

/// Same as [`health_check`] with an explicit connect timeout
pub async fn health_check_with_timeout(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(("localhost", port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!("Port {} not reachable: {}", port, e);
            false
        }
        Err(_) => {
            tracing::debug!("Port {} check timed out after {:?}", port, timeout);
            false
        }
    }
}
