//! Upstream-to-client relay task
//!
//! One task per established upstream. It copies until the upstream reaches
//! EOF or fails, half-closes the client, then clears the upstream from the
//! connection context so later client bytes close the connection.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::context::ConnectionContext;
use crate::connection::ConnectionStats;
use crate::error::RelayError;

/// Read buffer for the upstream leg
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy `upstream` into `client` until EOF or error.
///
/// Bytes are counted as they are delivered, so a failed relay still
/// reports what reached the client. On failure the connection context is
/// told, and the driver tears down the client leg as well.
///
/// # Errors
///
/// Returns `RelayError` if either leg fails mid-stream.
pub async fn relay_to_client(
    mut upstream: OwnedReadHalf,
    mut client: OwnedWriteHalf,
    ctx: Arc<ConnectionContext>,
    stats: Arc<ConnectionStats>,
) -> Result<u64, RelayError> {
    let result = copy_counted(&mut upstream, &mut client, &stats).await;

    let _ = client.shutdown().await;
    ctx.close_upstream().await;

    match &result {
        Ok(n) => debug!("Upstream closed after {} bytes", n),
        Err(e) => {
            debug!("Relay to client ended: {}", e);
            ctx.signal_relay_failure();
        }
    }

    result
}

async fn copy_counted(
    upstream: &mut OwnedReadHalf,
    client: &mut OwnedWriteHalf,
    stats: &ConnectionStats,
) -> Result<u64, RelayError> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = upstream
            .read(&mut buf)
            .await
            .map_err(|e| RelayError::read("upstream", e))?;
        if n == 0 {
            return Ok(total);
        }

        client
            .write_all(&buf[..n])
            .await
            .map_err(|e| RelayError::write("client", e))?;
        stats.add_bytes_down(n as u64);
        total += n as u64;
    }
}
