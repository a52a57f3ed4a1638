use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{info, warn};

use super::{MemoryStore, Store};
use crate::{
    error::StoreError,
    types::{Appended, Identity, IdentityPatch, Message},
};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogRecord {
    Identity { identity: Identity },
    Message { message: Message },
}

/// Local append-only JSONL backend.
///
/// The log is replayed into a [`MemoryStore`] on open. A record is flushed and
/// synced before the index exposes it, so a returned append is durable.
pub struct FileStore {
    path: PathBuf,
    index: MemoryStore,
    log: Mutex<File>,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let index = MemoryStore::new();
        let (records, skipped) = replay(&index, &content);
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "skipped unreadable log lines");
        }
        info!(path = %path.display(), records, "file store loaded");

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // a torn final line must not swallow the next record
        if !content.is_empty() && !content.ends_with('\n') {
            log.write_all(b"\n").await?;
            log.flush().await?;
        }

        Ok(Self {
            path,
            index,
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_record(file: &mut File, record: &LogRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

fn replay(index: &MemoryStore, content: &str) -> (usize, usize) {
    let mut records = 0;
    let mut skipped = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Identity { identity }) => index.put_identity(identity),
            Ok(LogRecord::Message { message }) => {
                index.insert_message(message);
            }
            Err(_) => {
                skipped += 1;
                continue;
            }
        }
        records += 1;
    }
    (records, skipped)
}

#[async_trait]
impl Store for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn list_identities(&self) -> HashMap<String, Identity> {
        self.index.list_identities().await
    }

    async fn get_identity(&self, id: &str) -> Option<Identity> {
        self.index.get_identity(id).await
    }

    async fn upsert_identity(
        &self,
        id: &str,
        patch: IdentityPatch,
    ) -> Result<Identity, StoreError> {
        let mut log = self.log.lock().await;
        let mut merged = self
            .index
            .get_identity(id)
            .await
            .unwrap_or_else(|| Identity::new(id));
        merged.apply(&patch);
        Self::write_record(
            &mut log,
            &LogRecord::Identity {
                identity: merged.clone(),
            },
        )
        .await?;
        self.index.put_identity(merged.clone());
        Ok(merged)
    }

    async fn append_message(&self, message: Message) -> Result<Appended, StoreError> {
        let mut log = self.log.lock().await;
        if self.index.contains_message(&message.id) {
            return Ok(self.index.insert_message(message));
        }
        Self::write_record(
            &mut log,
            &LogRecord::Message {
                message: message.clone(),
            },
        )
        .await?;
        Ok(self.index.insert_message(message))
    }

    async fn list_messages(&self, identity_id: &str) -> Vec<Message> {
        self.index.list_messages(identity_id).await
    }

    async fn list_messages_since(&self, identity_id: &str, since: i64) -> Vec<Message> {
        self.index.list_messages_since(identity_id, since).await
    }

    async fn list_recent_non_operator_messages(
        &self,
        identity_id: &str,
        limit: usize,
    ) -> Vec<Message> {
        self.index
            .list_recent_non_operator_messages(identity_id, limit)
            .await
    }
}
