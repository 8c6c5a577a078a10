//! Media broker reachability
//!
//! The broker runs as a separate service on the same unit. Ingest finds
//! out it is down through pipeline errors, but subscriber recorders would
//! only discover it after building a graph per camera; a cheap TCP
//! preflight turns that into one clear error before any file is created.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::{AppError, Result};

/// Bound on the reachability probe
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Check that the broker's RTSP port accepts connections.
pub async fn check_broker(broker: &BrokerConfig) -> Result<()> {
    let addr = format!("{}:{}", broker.host, broker.rtsp_port);

    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => {
            debug!("Broker reachable at {}", addr);
            Ok(())
        }
        Ok(Err(e)) => Err(AppError::BrokerUnreachable(format!("{}: {}", addr, e))),
        Err(_) => Err(AppError::BrokerUnreachable(format!(
            "{}: connect timed out",
            addr
        ))),
    }
}
