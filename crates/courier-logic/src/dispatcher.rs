//! Fan-out of ingested envelopes.
//!
//! Every envelope consumed from the ingest topic is validated, persisted,
//! marked as its conversation's latest message, and then routed once per
//! recipient: to the delivery topic of the gateway holding the recipient's
//! connection, or to the recipient's offline queue. Recipients are routed
//! independently; one failing never stops the others.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use courier_broker::{Broker, BrokerMessage, MessageHandler};
use courier_shared::codec::{decode, encode_for_broker};
use courier_shared::{Envelope, GatewayId, MessageType, Topics, UserId};
use courier_store::{
    with_retries, ConversationStore, GroupDirectory, MessageStore, OfflineStore, PresenceRegistry,
};

use crate::error::DispatchError;

const PERSIST_ATTEMPTS: u32 = 3;
const LOOKUP_ATTEMPTS: u32 = 2;
const OFFLINE_ATTEMPTS: u32 = 3;

/// The storage seams the logic tier works against.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub groups: Arc<dyn GroupDirectory>,
    pub presence: Arc<dyn PresenceRegistry>,
    pub offline: Arc<dyn OfflineStore>,
}

impl Stores {
    /// Use one backend for every seam.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: MessageStore + ConversationStore + GroupDirectory + PresenceRegistry + OfflineStore + 'static,
    {
        Self {
            messages: store.clone(),
            conversations: store.clone(),
            groups: store.clone(),
            presence: store.clone(),
            offline: store,
        }
    }
}

/// Per-message fan-out result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub id: String,
    /// The id was already stored with the same message; the stored copy
    /// was fanned out again.
    pub duplicate: bool,
    /// Recipients published to a gateway delivery topic.
    pub online: Vec<UserId>,
    /// Recipients whose copy went to the offline queue.
    pub offline: Vec<UserId>,
    /// Recipients whose copy could be neither published nor queued.
    pub failed: Vec<UserId>,
}

impl DispatchReport {
    pub fn recipients(&self) -> usize {
        self.online.len() + self.offline.len() + self.failed.len()
    }
}

enum Route {
    Online(GatewayId),
    Offline,
    Failed,
}

pub struct Dispatcher {
    stores: Stores,
    broker: Arc<dyn Broker>,
    topics: Topics,
    offline_ttl: Duration,
}

impl Dispatcher {
    pub fn new(stores: Stores, broker: Arc<dyn Broker>, topics: Topics, offline_ttl: Duration) -> Self {
        Self {
            stores,
            broker,
            topics,
            offline_ttl,
        }
    }

    /// Route one envelope. An `Err` means nothing was delivered; see
    /// [`DispatchError`] for the reasons.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchReport, DispatchError> {
        envelope.validate()?;

        let messages = &self.stores.messages;
        let inserted = with_retries("messages.persist", PERSIST_ATTEMPTS, || messages.persist(envelope))
            .await
            .map_err(DispatchError::Persist)?;
        let stored;
        let envelope = if inserted {
            envelope
        } else {
            stored = self.stored_original(envelope).await?;
            &stored
        };

        if let Err(e) = self.stores.conversations.touch_last_message(envelope).await {
            warn!(
                id = %envelope.id,
                conversation = %envelope.conversation_id,
                error = %e,
                "Failed to update conversation marker"
            );
        }

        let recipients = self.resolve_recipients(envelope).await?;

        let mut report = DispatchReport {
            id: envelope.id.clone(),
            duplicate: !inserted,
            ..Default::default()
        };

        for recipient in recipients {
            match self.route(envelope, &recipient).await {
                Route::Online(gateway) => {
                    debug!(id = %envelope.id, user = %recipient, gateway = %gateway, "Routed online");
                    report.online.push(recipient);
                }
                Route::Offline => report.offline.push(recipient),
                Route::Failed => report.failed.push(recipient),
            }
        }

        Ok(report)
    }

    /// An id that is already stored only fans out again when it carries
    /// the message stored under it, and then only the stored copy goes out.
    async fn stored_original(&self, envelope: &Envelope) -> Result<Envelope, DispatchError> {
        let messages = &self.stores.messages;
        let original = with_retries("messages.find", LOOKUP_ATTEMPTS, || messages.find(&envelope.id))
            .await
            .map_err(DispatchError::Persist)?;
        match original {
            Some(original) if original.same_message(envelope) => Ok(original),
            _ => Err(DispatchError::IdConflict(envelope.id.clone())),
        }
    }

    /// Private: the addressed user. Group: the current member list. The
    /// sender never receives its own message; duplicates are collapsed.
    async fn resolve_recipients(&self, envelope: &Envelope) -> Result<Vec<UserId>, DispatchError> {
        let candidates: Vec<UserId> = match envelope.message_type {
            MessageType::Private => envelope.recipient_id.iter().cloned().collect(),
            MessageType::Group => {
                let Some(group) = envelope.group_id.as_ref() else {
                    return Ok(Vec::new());
                };
                let groups = &self.stores.groups;
                with_retries("groups.members", LOOKUP_ATTEMPTS, || groups.members(group))
                    .await
                    .map_err(DispatchError::Recipients)?
            }
        };

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|user| *user != envelope.sender_id && !user.is_empty())
            .filter(|user| seen.insert(user.clone()))
            .collect())
    }

    async fn route(&self, envelope: &Envelope, recipient: &UserId) -> Route {
        let copy = envelope.for_recipient(recipient);
        let payload = match encode_for_broker(&copy) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %envelope.id, user = %recipient, error = %e, "Failed to encode copy");
                return Route::Failed;
            }
        };

        match self.stores.presence.get(recipient).await {
            Ok(Some(gateway)) => {
                let topic = self.topics.delivery(&gateway);
                match self
                    .broker
                    .publish(&topic, Some(recipient.as_str()), payload.clone())
                    .await
                {
                    Ok(()) => return Route::Online(gateway),
                    Err(e) => warn!(
                        id = %envelope.id,
                        user = %recipient,
                        topic = %topic,
                        error = %e,
                        "Delivery publish failed, queueing offline"
                    ),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                id = %envelope.id,
                user = %recipient,
                error = %e,
                "Presence lookup failed, queueing offline"
            ),
        }

        self.store_offline(envelope, recipient, payload).await
    }

    async fn store_offline(&self, envelope: &Envelope, recipient: &UserId, payload: Bytes) -> Route {
        let offline = &self.stores.offline;
        let ttl = self.offline_ttl;
        match with_retries("offline.append", OFFLINE_ATTEMPTS, || {
            offline.append(recipient, payload.clone(), ttl)
        })
        .await
        {
            Ok(()) => {
                debug!(id = %envelope.id, user = %recipient, "Queued offline");
                Route::Offline
            }
            Err(e) => {
                warn!(id = %envelope.id, user = %recipient, error = %e, "Message lost: offline append failed");
                Route::Failed
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
        let (envelope, _) = decode(&message.payload).map_err(DispatchError::from)?;
        let report = self.dispatch(&envelope).await?;
        info!(
            id = %report.id,
            conversation = %envelope.conversation_id,
            online = report.online.len(),
            offline = report.offline.len(),
            failed = report.failed.len(),
            duplicate = report.duplicate,
            "Dispatched"
        );
        Ok(())
    }
}
