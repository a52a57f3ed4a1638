use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    clock::Clock,
    config::Config,
    dedup::{DeliveryTracker, InboundDedup},
    identity::IdentityResolver,
    ledger::Ledger,
    relay::Outbox,
    store::Store,
};

pub const GUEST_PREFIX: &str = "guest_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_external_platform_user: bool,
    #[serde(default)]
    pub last_active_at: i64,
    #[serde(default)]
    pub last_message_text: Option<String>,
}

impl Identity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: None,
            is_external_platform_user: false,
            last_active_at: 0,
            last_message_text: None,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.id.starts_with(GUEST_PREFIX)
    }

    /// Merges `patch` into this record. Absent fields leave existing values alone.
    pub fn apply(&mut self, patch: &IdentityPatch) {
        if let Some(name) = &patch.display_name {
            self.display_name = Some(name.clone());
        }
        if let Some(external) = patch.is_external_platform_user {
            self.is_external_platform_user = external;
        }
        if let Some(at) = patch.last_active_at {
            self.last_active_at = at;
        }
        if let Some(text) = &patch.last_message_text {
            self.last_message_text = Some(text.clone());
        }
    }
}

/// Partial identity update. `None` means "leave as is", never "clear".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityPatch {
    pub display_name: Option<String>,
    pub is_external_platform_user: Option<bool>,
    pub last_active_at: Option<i64>,
    pub last_message_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub identity_id: String,
    pub text: String,
    pub from_operator: bool,
    pub sent_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Result of an append: the stored message and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub message: Message,
    pub inserted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionGuestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionGuestResponse {
    pub identity_id: String,
    pub display_name: Option<String>,
    /// How often the widget should poll.
    #[serde(default)]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSendBody {
    #[serde(default)]
    pub identity_token: Option<String>,
    pub text: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSendResponse {
    pub accepted: bool,
    pub is_duplicate: bool,
    pub canonical_identity_id: String,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    #[serde(default)]
    pub identity_id: String,
    #[serde(default)]
    pub last_timestamp: Option<String>,
}

impl PollQuery {
    /// Unparsable or missing watermarks read as zero.
    pub fn watermark(&self) -> i64 {
        self.last_timestamp
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub messages: Vec<Message>,
    pub server_timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorReplyBody {
    #[serde(default)]
    pub identity_id: String,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorReplyResponse {
    pub message_id: String,
    pub message: Message,
    pub external_platform_user: bool,
    pub delivered_to_guest: bool,
    pub relay_queued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityListResponse {
    pub identities: Vec<Identity>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub identity_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub backend: &'static str,
    pub identities: usize,
    pub guests: usize,
    pub platform_users: usize,
    pub messages: usize,
    pub operator_messages: usize,
    pub visitor_messages: usize,
    pub recent: Vec<MessagePreview>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub id: String,
    pub from: &'static str,
    pub text: String,
    pub time: String,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub identities: IdentityResolver,
    pub ledger: Ledger,
    pub delivery: DeliveryTracker,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        outbox: Option<Outbox>,
    ) -> Self {
        let identities = IdentityResolver::new(
            store.clone(),
            clock.clone(),
            config.sentinel_names.clone(),
        );
        let inbound = Arc::new(InboundDedup::new(clock.clone(), &config.dedup));
        let ledger = Ledger::new(store.clone(), clock.clone(), inbound, outbox)
            .with_recent_scan(config.dedup.recent_scan);
        let delivery = DeliveryTracker::new(clock.clone(), &config.delivery);
        Self {
            config,
            store,
            clock,
            identities,
            ledger,
            delivery,
        }
    }
}
