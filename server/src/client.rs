//! Client side of the polling protocol, as run by the chat widget.
//!
//! [`SyncSession`] is the pure state machine: watermark, seen ids and the
//! optimistic outgoing queue. [`SyncClient`] drives it over HTTP.

use std::{collections::HashSet, sync::Arc, time::Duration};

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{
    Message, PollResponse, ProvisionGuestBody, ProvisionGuestResponse, WidgetSendBody,
    WidgetSendResponse,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no identity yet, provision a session first")]
    NotIdentified,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Identified,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A message the user submitted, shown before the server confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub client_message_id: String,
    pub text: String,
    pub status: DeliveryStatus,
    /// Server id once confirmed. For a duplicate this is the earlier message.
    pub message_id: Option<String>,
}

#[derive(Debug)]
pub struct SyncSession {
    phase: SyncPhase,
    identity_id: Option<String>,
    watermark: i64,
    seen: HashSet<String>,
    messages: Vec<Message>,
    outgoing: Vec<OutgoingMessage>,
    poll_interval: Duration,
}

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSession {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            identity_id: None,
            watermark: 0,
            seen: HashSet::new(),
            messages: Vec::new(),
            outgoing: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.identity_id.as_deref()
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn outgoing(&self) -> &[OutgoingMessage] {
        &self.outgoing
    }

    /// Interval advertised by the server at provisioning time.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_sending(&self) -> bool {
        self.outgoing
            .iter()
            .any(|m| m.status == DeliveryStatus::Pending)
    }

    /// Adopts the identity from guest provisioning or a platform handoff.
    /// Switching identities starts a fresh timeline.
    pub fn identify(&mut self, identity_id: &str) {
        if self.identity_id.as_deref() != Some(identity_id) {
            *self = Self::new();
            self.identity_id = Some(identity_id.to_string());
        }
        if self.phase == SyncPhase::Uninitialized {
            self.phase = SyncPhase::Identified;
        }
    }

    pub fn start_polling(&mut self) -> Result<(), SyncError> {
        match self.phase {
            SyncPhase::Uninitialized => Err(SyncError::NotIdentified),
            _ => {
                self.phase = SyncPhase::Polling;
                Ok(())
            }
        }
    }

    /// Folds a poll response into the session and returns the messages that
    /// are new to the timeline.
    ///
    /// The watermark moves to the highest `sent_at` seen and never goes back.
    /// A message the user sent from this session confirms its outgoing entry
    /// instead of appearing twice.
    pub fn apply_batch(&mut self, batch: Vec<Message>) -> Vec<Message> {
        if let Some(max) = batch.iter().map(|m| m.sent_at).max() {
            self.watermark = self.watermark.max(max);
        }

        let mut fresh = Vec::new();
        for message in batch {
            if !self.seen.insert(message.id.clone()) {
                continue;
            }
            let own = self.outgoing.iter_mut().find(|o| {
                o.message_id.as_deref() == Some(message.id.as_str())
                    || o.client_message_id == message.id
            });
            match own {
                Some(outgoing) => {
                    outgoing.status = DeliveryStatus::Confirmed;
                    outgoing.message_id = Some(message.id.clone());
                }
                None => fresh.push(message.clone()),
            }
            self.messages.push(message);
        }
        self.messages.sort_by_key(|m| m.sent_at);
        fresh
    }

    /// Queues `text` for sending and returns the request body to post.
    pub fn begin_send(&mut self, text: &str) -> Result<WidgetSendBody, SyncError> {
        let identity_id = self.identity_id.clone().ok_or(SyncError::NotIdentified)?;
        let client_message_id = format!("cm_{}", Uuid::new_v4().simple());
        self.outgoing.push(OutgoingMessage {
            client_message_id: client_message_id.clone(),
            text: text.to_string(),
            status: DeliveryStatus::Pending,
            message_id: None,
        });
        Ok(WidgetSendBody {
            identity_token: Some(identity_id),
            text: text.to_string(),
            client_message_id: Some(client_message_id),
            display_name: None,
        })
    }

    /// Settles an outgoing entry. `None` means the request failed.
    pub fn complete_send(&mut self, client_message_id: &str, response: Option<&WidgetSendResponse>) {
        let Some(outgoing) = self
            .outgoing
            .iter_mut()
            .find(|o| o.client_message_id == client_message_id)
        else {
            return;
        };
        match response {
            Some(response) if response.accepted => {
                outgoing.status = DeliveryStatus::Confirmed;
                outgoing.message_id = Some(response.message_id.clone());
            }
            _ => outgoing.status = DeliveryStatus::Failed,
        }
    }
}

/// HTTP driver for a [`SyncSession`]. Cheap to clone; clones share the session.
#[derive(Debug, Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<Mutex<SyncSession>>,
}

impl SyncClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: Arc::new(Mutex::new(SyncSession::new())),
        }
    }

    pub fn session(&self) -> MutexGuard<'_, SyncSession> {
        self.session.lock()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn provision(
        &self,
        client_token: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<ProvisionGuestResponse, SyncError> {
        let body = ProvisionGuestBody {
            client_token: client_token.map(str::to_string),
            display_name: display_name.map(str::to_string),
        };
        let response = self
            .http
            .post(self.url("/api/widget/session"))
            .json(&body)
            .send()
            .await?;
        let provisioned: ProvisionGuestResponse = decode(response).await?;
        let mut session = self.session.lock();
        session.identify(&provisioned.identity_id);
        if provisioned.poll_interval_ms > 0 {
            session.poll_interval = Duration::from_millis(provisioned.poll_interval_ms);
        }
        drop(session);
        Ok(provisioned)
    }

    /// Platform handoff: the identity is already known to the caller.
    pub fn adopt(&self, identity_id: &str) {
        self.session.lock().identify(identity_id);
    }

    pub async fn poll_once(&self) -> Result<Vec<Message>, SyncError> {
        let (identity_id, watermark) = {
            let session = self.session.lock();
            let identity_id = session.identity_id().ok_or(SyncError::NotIdentified)?.to_string();
            (identity_id, session.watermark())
        };
        let response = self
            .http
            .get(self.url("/api/widget/poll"))
            .query(&[
                ("identityId", identity_id.as_str()),
                ("lastTimestamp", watermark.to_string().as_str()),
            ])
            .send()
            .await?;
        let batch: PollResponse = decode(response).await?;
        Ok(self.session.lock().apply_batch(batch.messages))
    }

    /// Sends independently of the poll loop; the outgoing entry is visible as
    /// pending until the server answers.
    pub async fn send(&self, text: &str) -> Result<WidgetSendResponse, SyncError> {
        let body = self.session.lock().begin_send(text)?;
        let client_message_id = body.client_message_id.clone().unwrap_or_default();

        let result = async {
            let response = self
                .http
                .post(self.url("/api/widget/message"))
                .json(&body)
                .send()
                .await?;
            decode::<WidgetSendResponse>(response).await
        }
        .await;

        let mut session = self.session.lock();
        match &result {
            Ok(response) => session.complete_send(&client_message_id, Some(response)),
            Err(err) => {
                warn!(client_message_id, error = %err, "send failed");
                session.complete_send(&client_message_id, None);
            }
        }
        result
    }

    /// Polls once immediately, then every `interval` until `shutdown` flips to
    /// `true` or its sender is dropped. Failed polls are logged and retried on
    /// the next tick. A poll still in flight is abandoned on shutdown.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        self.session.lock().start_polling()?;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if stop_requested(changed, &shutdown) {
                        return Ok(());
                    }
                    continue;
                }
            }
            tokio::select! {
                result = self.poll_once() => match result {
                    Ok(fresh) if !fresh.is_empty() => debug!(count = fresh.len(), "new messages"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "poll failed"),
                },
                changed = shutdown.changed() => {
                    if stop_requested(changed, &shutdown) {
                        debug!("shutdown during poll");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn stop_requested(
    changed: Result<(), watch::error::RecvError>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *shutdown.borrow()
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    Err(SyncError::Server {
        status: status.as_u16(),
        message,
    })
}
