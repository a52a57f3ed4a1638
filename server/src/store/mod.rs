//! Persistent store contract and its backends.
//!
//! Every backend honours the same rules:
//!
//! - `upsert_identity` creates the identity when absent and never writes an
//!   absent field over a stored one.
//! - `append_message` is idempotent on message id and updates the owning
//!   identity's `last_active_at` / `last_message_text` in the same operation,
//!   creating the identity first if needed.
//! - reads never fail: backend errors are logged and surface as empty results.

mod file;
mod memory;
mod postgres;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    config::StoreBackend,
    error::StoreError,
    types::{Appended, Identity, IdentityPatch, Message},
};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn list_identities(&self) -> HashMap<String, Identity>;

    async fn get_identity(&self, id: &str) -> Option<Identity> {
        self.list_identities().await.remove(id)
    }

    async fn upsert_identity(&self, id: &str, patch: IdentityPatch)
        -> Result<Identity, StoreError>;

    async fn append_message(&self, message: Message) -> Result<Appended, StoreError>;

    async fn list_messages(&self, identity_id: &str) -> Vec<Message>;

    /// Messages with `sent_at` strictly greater than `since`.
    async fn list_messages_since(&self, identity_id: &str, since: i64) -> Vec<Message>;

    /// Newest first.
    async fn list_recent_non_operator_messages(
        &self,
        identity_id: &str,
        limit: usize,
    ) -> Vec<Message>;
}

/// Opens the configured backend. This is the only place that looks at the
/// backend kind.
pub async fn open(backend: &StoreBackend) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File { path } => Arc::new(FileStore::open(path).await?),
        StoreBackend::Postgres { url } => Arc::new(PgStore::connect(url).await?),
    };
    tracing::info!(backend = store.backend_name(), "store opened");
    Ok(store)
}

/// Orders by `sent_at`, keeping insertion order for ties.
pub(crate) fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.sent_at);
}
