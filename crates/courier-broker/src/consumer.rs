//! Consumer loops shared by the gateway and the logic tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerMessage, Subscription};

const RESUBSCRIBE_MIN: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Errors are logged and the message is treated as consumed.
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()>;
}

/// Feed `subscription` to `handler` until it closes or `cancel` fires.
/// A message that has been received is always handled to completion.
/// Returns the number of messages handled.
pub async fn consume<H>(
    mut subscription: Subscription,
    cancel: &CancellationToken,
    handler: &H,
) -> u64
where
    H: MessageHandler + ?Sized,
{
    let mut handled = 0u64;
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.recv() => match message {
                Some(message) => message,
                None => {
                    info!(
                        topic = subscription.topic(),
                        group = subscription.group(),
                        "Subscription closed"
                    );
                    break;
                }
            },
        };

        if let Err(e) = handler.handle(message).await {
            warn!(topic = subscription.topic(), error = %e, "Message handler failed");
        }
        handled += 1;
    }
    handled
}

/// Subscribe and consume, re-subscribing with backoff whenever the
/// subscription is lost, until `cancel` fires.
pub async fn run_consumer(
    broker: Arc<dyn Broker>,
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    let mut backoff = RESUBSCRIBE_MIN;

    while !cancel.is_cancelled() {
        match broker.subscribe(&topic, &group).await {
            Ok(subscription) => {
                info!(topic = %topic, group = %group, "Consumer started");
                let handled = consume(subscription, &cancel, handler.as_ref()).await;
                debug!(topic = %topic, handled, "Consumer pass finished");
                if handled > 0 {
                    backoff = RESUBSCRIBE_MIN;
                }
            }
            Err(e) => {
                warn!(topic = %topic, group = %group, error = %e, "Subscribe failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
    }

    info!(topic = %topic, group = %group, "Consumer stopped");
}
