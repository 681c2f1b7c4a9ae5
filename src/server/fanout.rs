use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::connection::{ClientConnection, SendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
}

impl FanOutReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Send one payload to every connection concurrently and wait for all of
/// them. Each send is bounded by `timeout`; a failure is logged and counted,
/// never propagated. Failed connections are left for their own receive task
/// to reap.
pub async fn fan_out(
    connections: &[Arc<dyn ClientConnection>],
    payload: &Payload,
    timeout: Duration,
) -> FanOutReport {
    let sends = connections.iter().map(|conn| async move {
        let send = async {
            match payload {
                Payload::Text(text) => conn.send_text(text).await,
                Payload::Binary(data) => conn.send_binary(data).await,
            }
        };
        let result = match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout)),
        };
        if let Err(ref e) = result {
            debug!(conn = %conn.id(), peer = %conn.peer(), error = %e, "Send failed");
        }
        result.is_ok()
    });

    let mut report = FanOutReport::default();
    for delivered in join_all(sends).await {
        if delivered {
            report.delivered += 1;
        } else {
            report.failed += 1;
        }
    }
    report
}
