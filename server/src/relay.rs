//! Best-effort forwarding of operator replies to the messaging platform.
//!
//! The ledger only enqueues a [`RelayTask`]; a background worker owns all
//! network I/O. Failures are logged and dropped. There is no retry queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTask {
    pub recipient_id: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("platform rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, task: &RelayTask) -> Result<(), RelayError>;
}

/// Sends through the page send API (`POST {graph}/me/messages`).
pub struct MessengerTransport {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl MessengerTransport {
    pub fn new(client: reqwest::Client, graph_url: &str, access_token: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/me/messages", graph_url.trim_end_matches('/')),
            access_token: access_token.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MessengerTransport {
    async fn deliver(&self, task: &RelayTask) -> Result<(), RelayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("access_token", self.access_token.as_str())])
            .json(&json!({
                "recipient": { "id": task.recipient_id },
                "message": { "text": task.text },
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let body = if body.len() > 220 {
            format!("{}...", body.chars().take(220).collect::<String>())
        } else {
            body
        };
        Err(RelayError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<RelayTask>,
}

impl Outbox {
    /// Queues a task. Returns `false` if the worker is gone.
    pub fn enqueue(&self, task: RelayTask) -> bool {
        match self.tx.send(task) {
            Ok(()) => true,
            Err(err) => {
                warn!(message_id = %err.0.message_id, "relay worker stopped, reply not forwarded");
                false
            }
        }
    }
}

/// Starts the relay worker. It runs until every [`Outbox`] clone is dropped.
pub fn spawn(transport: Arc<dyn Transport>) -> (Outbox, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayTask>();
    let handle = tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            debug!(recipient = %task.recipient_id, message_id = %task.message_id, "relaying reply");
            match transport.deliver(&task).await {
                Ok(()) => info!(
                    recipient = %task.recipient_id,
                    message_id = %task.message_id,
                    "reply delivered to platform"
                ),
                Err(err) => warn!(
                    recipient = %task.recipient_id,
                    message_id = %task.message_id,
                    error = %err,
                    "platform delivery failed"
                ),
            }
        }
    });
    (Outbox { tx }, handle)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Forwards every delivered task to a channel the test can await.
    pub struct ChannelTransport {
        pub delivered: mpsc::UnboundedSender<RelayTask>,
        pub fail: bool,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn deliver(&self, task: &RelayTask) -> Result<(), RelayError> {
            let _ = self.delivered.send(task.clone());
            if self.fail {
                return Err(RelayError::Rejected {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(())
        }
    }
}
