use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    dedup::InboundDedup,
    error::{LedgerError, ValidationError},
    relay::{Outbox, RelayTask},
    store::{sort_chronologically, Store},
    types::{Identity, Message},
};

/// Outcome of an inbound send. Duplicates are successful outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub message_id: String,
    pub is_duplicate: bool,
    /// The stored message, when known. A token-level duplicate is rejected
    /// before the store is consulted, so it carries none.
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub message: Message,
    pub external_platform_user: bool,
    pub relay_queued: bool,
}

pub struct Ledger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    inbound: Arc<InboundDedup>,
    outbox: Option<Outbox>,
    recent_scan: usize,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        inbound: Arc<InboundDedup>,
        outbox: Option<Outbox>,
    ) -> Self {
        Self {
            store,
            clock,
            inbound,
            outbox,
            recent_scan: 3,
        }
    }

    pub fn with_recent_scan(mut self, recent_scan: usize) -> Self {
        self.recent_scan = recent_scan;
        self
    }

    pub fn relay_enabled(&self) -> bool {
        self.outbox.is_some()
    }

    async fn require_identity(&self, identity_id: &str) -> Result<Identity, ValidationError> {
        if identity_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentity);
        }
        self.store
            .get_identity(identity_id)
            .await
            .ok_or_else(|| ValidationError::UnknownIdentity(identity_id.to_string()))
    }

    /// Records a message from the identity itself (visitor or platform user).
    pub async fn record_incoming(
        &self,
        identity_id: &str,
        text: &str,
        client_message_id: Option<&str>,
        meta: Option<Value>,
    ) -> Result<Recorded, LedgerError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyText.into());
        }
        // The append creates the identity when its profile write was lost.
        if identity_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentity.into());
        }

        let client_message_id = client_message_id.map(str::trim).filter(|id| !id.is_empty());
        if let Some(client_id) = client_message_id {
            if self.inbound.check_and_remember(client_id) {
                info!(identity_id, client_message_id = client_id, "duplicate message id rejected");
                return Ok(Recorded {
                    message_id: self.inbound.canonical_id(client_id),
                    is_duplicate: true,
                    message: None,
                });
            }
        }

        let recent = self
            .store
            .list_recent_non_operator_messages(identity_id, self.recent_scan)
            .await;
        if let Some(previous) = self.inbound.find_repeat(&recent, text) {
            info!(identity_id, message_id = %previous.id, "duplicate text inside window rejected");
            if let Some(client_id) = client_message_id {
                self.inbound.alias(client_id, &previous.id);
            }
            return Ok(Recorded {
                message_id: previous.id.clone(),
                is_duplicate: true,
                message: Some(previous.clone()),
            });
        }

        let message = Message {
            id: client_message_id
                .map(str::to_string)
                .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple())),
            identity_id: identity_id.to_string(),
            text: text.to_string(),
            from_operator: false,
            sent_at: self.clock.now_millis(),
            meta,
        };
        let appended = match self.store.append_message(message).await {
            Ok(appended) => appended,
            Err(err) => {
                if let Some(client_id) = client_message_id {
                    self.inbound.forget(client_id);
                }
                warn!(identity_id, error = %err, "message append failed");
                return Err(err.into());
            }
        };

        Ok(Recorded {
            message_id: appended.message.id.clone(),
            is_duplicate: !appended.inserted,
            message: Some(appended.message),
        })
    }

    /// Records an operator reply and, for platform identities, queues it for
    /// the relay. Replies always get a fresh server-side id.
    pub async fn record_operator_reply(
        &self,
        identity_id: &str,
        text: &str,
    ) -> Result<Reply, LedgerError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyText.into());
        }
        let identity = self.require_identity(identity_id).await?;

        let message = Message {
            id: format!("op_{}", Uuid::new_v4().simple()),
            identity_id: identity.id.clone(),
            text: text.to_string(),
            from_operator: true,
            sent_at: self.clock.now_millis(),
            meta: None,
        };
        let appended = self.store.append_message(message).await.map_err(|err| {
            warn!(identity_id, error = %err, "operator reply append failed");
            err
        })?;

        let external = identity.is_external_platform_user;
        let relay_queued = match (&self.outbox, external) {
            (Some(outbox), true) => outbox.enqueue(RelayTask {
                recipient_id: identity.id.clone(),
                message_id: appended.message.id.clone(),
                text: appended.message.text.clone(),
            }),
            _ => false,
        };
        info!(
            identity_id,
            message_id = %appended.message.id,
            external,
            relay_queued,
            "operator reply stored"
        );

        Ok(Reply {
            message: appended.message,
            external_platform_user: external,
            relay_queued,
        })
    }

    pub async fn get_conversation(&self, identity_id: &str) -> Vec<Message> {
        let mut messages = self.store.list_messages(identity_id).await;
        sort_chronologically(&mut messages);
        messages
    }

    /// Both directions, strictly after `since`, ascending.
    pub async fn get_new_since(&self, identity_id: &str, since: i64) -> Vec<Message> {
        let mut messages = self.store.list_messages_since(identity_id, since).await;
        sort_chronologically(&mut messages);
        messages
    }
}
