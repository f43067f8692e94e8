//! Reconnect sync: drain a user's offline backlog to the gateway that now
//! holds the user's connection.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use courier_broker::{Broker, BrokerMessage, MessageHandler};
use courier_shared::{SyncRequest, Topics};
use courier_store::{with_retries, OfflineStore};

use crate::error::SyncError;

const DRAIN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub drained: usize,
    pub republished: usize,
    /// Entries put back in the queue after their publish failed.
    pub requeued: usize,
    /// Entries that could be neither published nor put back.
    pub lost: usize,
}

pub struct SyncCoordinator {
    offline: Arc<dyn OfflineStore>,
    broker: Arc<dyn Broker>,
    topics: Topics,
}

impl SyncCoordinator {
    pub fn new(offline: Arc<dyn OfflineStore>, broker: Arc<dyn Broker>, topics: Topics) -> Self {
        Self {
            offline,
            broker,
            topics,
        }
    }

    /// Drain the requesting user's backlog and republish it, in append
    /// order, to the delivery topic of the requesting gateway. An empty
    /// backlog publishes nothing.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        if !request.is_sync_offline() {
            return Err(SyncError::UnsupportedAction(request.action.clone()));
        }
        if request.identity.is_empty() || request.gateway.is_empty() {
            return Err(SyncError::MissingTarget);
        }

        let offline = &self.offline;
        let identity = &request.identity;
        let backlog = with_retries("offline.drain_backlog", DRAIN_ATTEMPTS, || {
            offline.drain_backlog(identity)
        })
        .await
        .map_err(SyncError::Drain)?;

        let mut report = SyncReport {
            drained: backlog.payloads.len(),
            ..Default::default()
        };
        if backlog.payloads.is_empty() {
            debug!(user = %identity, "Offline queue empty");
            return Ok(report);
        }

        let topic = self.topics.delivery(&request.gateway);
        let mut failed: Vec<Bytes> = Vec::new();
        for payload in backlog.payloads {
            // Once one publish fails the rest stay behind it so the backlog
            // keeps its order.
            if !failed.is_empty() {
                failed.push(payload);
                continue;
            }
            match self
                .broker
                .publish(&topic, Some(identity.as_str()), payload.clone())
                .await
            {
                Ok(()) => report.republished += 1,
                Err(e) => {
                    warn!(user = %identity, topic = %topic, error = %e, "Backlog publish failed");
                    failed.push(payload);
                }
            }
        }

        if failed.is_empty() {
            return Ok(report);
        }

        // Back at the head of the queue, ahead of anything appended during
        // the drain, with the drained entry's deadline.
        let count = failed.len();
        match with_retries("offline.restore", DRAIN_ATTEMPTS, || {
            offline.restore(identity, failed.clone(), backlog.expires_at_ms)
        })
        .await
        {
            Ok(()) => report.requeued = count,
            Err(e) => {
                warn!(user = %identity, error = %e, lost = count, "Message lost: requeue failed");
                report.lost = count;
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl MessageHandler for SyncCoordinator {
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
        let request = SyncRequest::from_bytes(&message.payload).map_err(SyncError::from)?;
        let report = self.sync(&request).await?;
        if report.drained > 0 {
            info!(
                user = %request.identity,
                gateway = %request.gateway,
                republished = report.republished,
                requeued = report.requeued,
                lost = report.lost,
                "Offline backlog synced"
            );
        }
        Ok(())
    }
}
