//! Broadcast engine
//!
//! Serializes a payload once, snapshots the registry and writes one text
//! frame to every open connection. Sends run concurrently and each one is
//! bounded by the connection's send timeout, so a slow or dead peer only
//! costs its own delivery. Fire-and-forget: no acknowledgment, no retry.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::SendError;
use crate::message::OutboundBroadcast;
use crate::registry::ConnectionRegistry;
use crate::types::{ChannelName, ConnectionId};

/// Outcome of one broadcast call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was written to
    pub delivered: usize,
    /// Connections skipped because they were not open
    pub skipped: usize,
    /// Connections whose send failed or timed out
    pub failed: Vec<ConnectionId>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// Fans messages out to the connections of a registry
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `payload` to every registered connection regardless of channel.
    ///
    /// `event` is only logged. Strings go out verbatim, anything else as JSON.
    /// Fails only if the payload cannot be serialized; per-connection
    /// failures are reported, never returned.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let broadcast = OutboundBroadcast::new(event, payload)?;
        Ok(deliver(self.registry.snapshot(), &broadcast).await)
    }

    /// Same as `broadcast`, limited to connections on `channel`
    pub async fn broadcast_to_channel<T: Serialize + ?Sized>(
        &self,
        channel: &ChannelName,
        event: &str,
        payload: &T,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let broadcast = OutboundBroadcast::new(event, payload)?;
        Ok(deliver(self.registry.snapshot_channel(channel), &broadcast).await)
    }
}

async fn deliver(targets: Vec<Arc<Connection>>, broadcast: &OutboundBroadcast) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    let (open, not_open): (Vec<_>, Vec<_>) = targets.into_iter().partition(|c| c.is_open());
    report.skipped = not_open.len();

    let sends = open.iter().map(|conn| async move {
        let result = conn.send_text(broadcast.payload.clone()).await;
        (conn.id(), result)
    });

    for (id, result) in join_all(sends).await {
        match result {
            Ok(()) => report.delivered += 1,
            // Closed between the snapshot and the send
            Err(SendError::NotOpen(_)) => report.skipped += 1,
            Err(e) => {
                warn!(connection_id = %id, event = %broadcast.event, "Broadcast send failed: {}", e);
                report.failed.push(id);
            }
        }
    }

    debug!(
        event = %broadcast.event,
        delivered = report.delivered,
        skipped = report.skipped,
        failed = report.failed.len(),
        "Broadcast complete"
    );
    report
}
