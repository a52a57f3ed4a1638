use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use super::Store;
use crate::{
    error::StoreError,
    types::{Appended, Identity, IdentityPatch, Message},
};

/// Process-memory backend. Also serves as the index behind [`super::FileStore`].
///
/// Conversations are sharded per identity so appends to different identities
/// do not contend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: DashMap<String, Identity>,
    conversations: DashMap<String, Vec<Message>>,
    // message id -> owning identity id
    message_owners: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains_message(&self, message_id: &str) -> bool {
        self.message_owners.contains_key(message_id)
    }

    fn merge_identity(&self, id: &str, patch: &IdentityPatch) -> Identity {
        let mut entry = self
            .identities
            .entry(id.to_string())
            .or_insert_with(|| Identity::new(id));
        entry.apply(patch);
        entry.clone()
    }

    /// Replaces a whole identity record, used when replaying a log.
    pub(crate) fn put_identity(&self, identity: Identity) {
        self.identities.insert(identity.id.clone(), identity);
    }

    pub(crate) fn insert_message(&self, message: Message) -> Appended {
        let slot = match self.message_owners.entry(message.id.clone()) {
            Entry::Occupied(existing) => {
                let owner = existing.get().clone();
                drop(existing);
                let stored = self.find_message(&owner, &message.id).unwrap_or(message);
                return Appended {
                    message: stored,
                    inserted: false,
                };
            }
            Entry::Vacant(slot) => slot,
        };

        self.conversations
            .entry(message.identity_id.clone())
            .or_default()
            .push(message.clone());
        {
            let mut identity = self
                .identities
                .entry(message.identity_id.clone())
                .or_insert_with(|| Identity::new(&message.identity_id));
            // an older message arriving late keeps the newer preview
            if message.sent_at >= identity.last_active_at {
                identity.last_active_at = message.sent_at;
                identity.last_message_text = Some(message.text.clone());
            }
        }
        slot.insert(message.identity_id.clone());

        Appended {
            message,
            inserted: true,
        }
    }

    fn find_message(&self, identity_id: &str, message_id: &str) -> Option<Message> {
        self.conversations
            .get(identity_id)
            .and_then(|list| list.iter().find(|m| m.id == message_id).cloned())
    }

    fn collect<F>(&self, identity_id: &str, keep: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.conversations
            .get(identity_id)
            .map(|list| list.iter().filter(|m| keep(m)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn list_identities(&self) -> HashMap<String, Identity> {
        self.identities
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    async fn get_identity(&self, id: &str) -> Option<Identity> {
        self.identities.get(id).map(|entry| entry.value().clone())
    }

    async fn upsert_identity(
        &self,
        id: &str,
        patch: IdentityPatch,
    ) -> Result<Identity, StoreError> {
        Ok(self.merge_identity(id, &patch))
    }

    async fn append_message(&self, message: Message) -> Result<Appended, StoreError> {
        Ok(self.insert_message(message))
    }

    async fn list_messages(&self, identity_id: &str) -> Vec<Message> {
        self.collect(identity_id, |_| true)
    }

    async fn list_messages_since(&self, identity_id: &str, since: i64) -> Vec<Message> {
        self.collect(identity_id, |m| m.sent_at > since)
    }

    async fn list_recent_non_operator_messages(
        &self,
        identity_id: &str,
        limit: usize,
    ) -> Vec<Message> {
        let mut messages = self.collect(identity_id, |m| !m.from_operator);
        messages.reverse();
        messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        messages.truncate(limit);
        messages
    }
}
