//! TCP readiness probing for freshly launched instances

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Upper bound on a single probe attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Check whether a TCP connection to `host:port` succeeds.
///
/// The connection is closed immediately on success. Every failure mode
/// (refused, timeout, unreachable host) collapses to `false`; this never
/// returns an error to the caller.
pub async fn is_reachable(host: &str, port: u16) -> bool {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            trace!(host, port, error = %e, "probe failed");
            false
        }
        Err(_) => {
            trace!(host, port, "probe timed out");
            false
        }
    }
}
