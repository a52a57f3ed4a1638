use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    clock::SystemClock,
    config::Config,
    dedup::Consumer,
    error::{ApiError, ValidationError},
    identity::random_guest_token,
    relay::{self, MessengerTransport},
    store, sync,
    types::*,
};

const PREVIEW_CHARS: usize = 30;
const RECENT_SAMPLE: usize = 5;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn millis_to_iso(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

fn preview_text(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Checks `x-hub-signature-256` against the raw body. Without a configured
/// secret every body is accepted.
fn verify_signature(app_secret: Option<&str>, signature_header: Option<&str>, body: &[u8]) -> bool {
    let Some(app_secret) = app_secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[derive(Debug, Clone, PartialEq)]
struct PageEvent {
    sender_id: String,
    mid: Option<String>,
    text: Option<String>,
    timestamp: Option<i64>,
}

/// Flattens every `entry[].messaging[]` message event. Echoes of our own
/// sends and events without a sender are skipped.
fn page_events(payload: &Value) -> Vec<PageEvent> {
    let mut events = Vec::new();
    let entries = payload.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let messaging = entry.get("messaging").and_then(Value::as_array);
        for event in messaging.into_iter().flatten() {
            let Some(message) = event.get("message") else {
                continue;
            };
            if message.get("is_echo").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let Some(sender_id) = event
                .get("sender")
                .and_then(|s| s.get("id"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
            else {
                continue;
            };
            events.push(PageEvent {
                sender_id: sender_id.to_string(),
                mid: message.get("mid").and_then(Value::as_str).map(str::to_string),
                text: message
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
                timestamp: event.get("timestamp").and_then(Value::as_i64),
            });
        }
    }
    events
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "now": now_iso(),
        "backend": state.store.backend_name(),
    }))
}

async fn messenger_webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected = &state.config.messenger.verify_token;

    if mode == "subscribe" && !expected.is_empty() && &verify_token == expected {
        info!("webhook verification succeeded");
        return (StatusCode::OK, challenge).into_response();
    }
    warn!(mode = %mode, "webhook verification rejected");
    ApiError::BadVerifyToken.into_response()
}

async fn messenger_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(
        state.config.messenger.app_secret.as_deref(),
        signature_header,
        &body,
    ) {
        warn!("webhook signature rejected");
        return Err(ApiError::BadSignature);
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    if payload.get("object").and_then(Value::as_str) != Some("page") {
        return Err(ApiError::NotPageEvent);
    }

    // The platform redelivers on anything but 200, so per-event failures are
    // logged and the batch is still acknowledged.
    for event in page_events(&payload) {
        let identity = match state
            .identities
            .resolve_platform_sender(&event.sender_id, None)
            .await
        {
            Ok(identity) => identity,
            Err(err) => {
                warn!(sender = %event.sender_id, error = %err, "platform sender rejected");
                continue;
            }
        };
        let Some(text) = event.text.as_deref() else {
            continue;
        };
        let meta = json!({
            "source": "messenger",
            "platformTimestamp": event.timestamp,
        });
        match state
            .ledger
            .record_incoming(&identity.id, text, event.mid.as_deref(), Some(meta))
            .await
        {
            Ok(recorded) => info!(
                identity_id = %identity.id,
                message_id = %recorded.message_id,
                is_duplicate = recorded.is_duplicate,
                "platform message received"
            ),
            Err(err) => warn!(identity_id = %identity.id, error = %err, "platform message dropped"),
        }
    }

    Ok((StatusCode::OK, "EVENT_RECEIVED").into_response())
}

async fn provision_widget_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProvisionGuestBody>,
) -> Result<Json<ProvisionGuestResponse>, ApiError> {
    let token = body
        .client_token
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(random_guest_token);
    let identity = state
        .identities
        .provision_guest(&token, body.display_name.as_deref())
        .await?;
    Ok(Json(ProvisionGuestResponse {
        identity_id: identity.id,
        display_name: identity.display_name,
        poll_interval_ms: state.config.poll_interval_ms,
    }))
}

async fn widget_send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WidgetSendBody>,
) -> Result<Json<WidgetSendResponse>, ApiError> {
    if body.text.trim().is_empty() {
        return Err(ValidationError::EmptyText.into());
    }
    let token = body
        .identity_token
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(random_guest_token);
    let identity = state
        .identities
        .provision_guest(&token, body.display_name.as_deref())
        .await?;
    let recorded = state
        .ledger
        .record_incoming(
            &identity.id,
            &body.text,
            body.client_message_id.as_deref(),
            None,
        )
        .await?;
    Ok(Json(WidgetSendResponse {
        accepted: true,
        is_duplicate: recorded.is_duplicate,
        canonical_identity_id: identity.id,
        message_id: recorded.message_id,
    }))
}

async fn widget_poll(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let consumer = Consumer::Widget(query.identity_id.trim().to_string());
    Ok(Json(sync::poll(&state, &consumer, query.watermark()).await?))
}

async fn operator_poll(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let consumer = Consumer::Operator(query.identity_id.trim().to_string());
    Ok(Json(sync::poll(&state, &consumer, query.watermark()).await?))
}

async fn list_identities(State(state): State<Arc<AppState>>) -> Json<IdentityListResponse> {
    let mut identities = state
        .store
        .list_identities()
        .await
        .into_values()
        .collect::<Vec<_>>();
    identities.sort_by(|a, b| {
        b.last_active_at
            .cmp(&a.last_active_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let count = identities.len();
    Json(IdentityListResponse { identities, count })
}

async fn get_conversation(
    Path(identity_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConversationResponse>, ApiError> {
    if state.identities.get_identity(&identity_id).await.is_none() {
        return Err(ValidationError::UnknownIdentity(identity_id).into());
    }
    let messages = state.ledger.get_conversation(&identity_id).await;
    Ok(Json(ConversationResponse {
        identity_id,
        messages,
    }))
}

async fn operator_reply(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OperatorReplyBody>,
) -> Result<Json<OperatorReplyResponse>, ApiError> {
    let reply = state
        .ledger
        .record_operator_reply(body.identity_id.trim(), &body.text)
        .await?;
    Ok(Json(OperatorReplyResponse {
        message_id: reply.message.id.clone(),
        message: reply.message,
        external_platform_user: reply.external_platform_user,
        delivered_to_guest: !reply.external_platform_user,
        relay_queued: reply.relay_queued,
    }))
}

async fn relay_stats(State(state): State<Arc<AppState>>) -> Json<RelayStats> {
    let identities = state.store.list_identities().await;
    let mut messages = Vec::new();
    for id in identities.keys() {
        messages.extend(state.store.list_messages(id).await);
    }
    messages.sort_by_key(|m| m.sent_at);

    let guests = identities.values().filter(|i| !i.is_external_platform_user).count();
    let operator_messages = messages.iter().filter(|m| m.from_operator).count();
    let recent = messages
        .iter()
        .rev()
        .take(RECENT_SAMPLE)
        .map(|m| MessagePreview {
            id: m.id.clone(),
            from: if m.from_operator { "operator" } else { "visitor" },
            text: preview_text(&m.text),
            time: millis_to_iso(m.sent_at),
        })
        .collect();

    Json(RelayStats {
        backend: state.store.backend_name(),
        identities: identities.len(),
        guests,
        platform_users: identities.len() - guests,
        messages: messages.len(),
        operator_messages,
        visitor_messages: messages.len() - operator_messages,
        recent,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/messenger/webhook",
            get(messenger_webhook_verify).post(messenger_webhook_event),
        )
        .route("/api/widget/session", post(provision_widget_session))
        .route("/api/widget/message", post(widget_send_message))
        .route("/api/widget/poll", get(widget_poll))
        .route("/api/operator/poll", get(operator_poll))
        .route("/api/operator/identities", get(list_identities))
        .route(
            "/api/operator/identities/{identity_id}/messages",
            get(get_conversation),
        )
        .route("/api/operator/reply", post(operator_reply))
        .route("/api/operator/stats", get(relay_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chat_relay=info,tower_http=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    let store = store::open(&config.backend)
        .await
        .with_context(|| format!("failed to open {} store", config.backend.name()))?;

    let outbox = match config.messenger.page_access_token.as_deref() {
        Some(token) => {
            let transport = MessengerTransport::new(
                reqwest::Client::new(),
                &config.messenger.graph_url,
                token,
            );
            let (outbox, _worker) = relay::spawn(Arc::new(transport));
            Some(outbox)
        }
        None => {
            warn!("MESSENGER_PAGE_ACCESS_TOKEN not set, replies stay local");
            None
        }
    };

    let port = config.port;
    let state = Arc::new(AppState::new(
        config,
        store,
        Arc::new(SystemClock),
        outbox,
    ));
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("chat relay running at http://localhost:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failure")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    fn state_with(config: Config) -> Arc<AppState> {
        Arc::new(AppState::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            None,
        ))
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn page_payload() -> Value {
        json!({
            "object": "page",
            "entry": [
                {
                    "messaging": [
                        { "sender": { "id": "24680" }, "timestamp": 5, "message": { "mid": "m.1", "text": "hello" } },
                        { "sender": { "id": "24680" }, "message": { "mid": "m.2", "text": "again", "is_echo": true } },
                        { "sender": { "id": "13579" }, "message": { "mid": "m.3", "attachments": [] } }
                    ]
                },
                {
                    "messaging": [
                        { "sender": { "id": "13579" }, "message": { "mid": "m.4", "text": " second entry " } },
                        { "sender": { "id": "13579" }, "read": { "watermark": 1 } }
                    ]
                }
            ]
        })
    }

    #[test]
    fn test_page_events_flattens_every_entry() {
        let events = page_events(&page_payload());
        let summary = events
            .iter()
            .map(|e| (e.sender_id.as_str(), e.mid.as_deref(), e.text.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("24680", Some("m.1"), Some("hello")),
                ("13579", Some("m.3"), None),
                ("13579", Some("m.4"), Some("second entry")),
            ]
        );
        assert_eq!(events[0].timestamp, Some(5));
        assert!(page_events(&json!({ "object": "page" })).is_empty());
    }

    #[test]
    fn test_signature_check() {
        let body = br#"{"object":"page"}"#;
        assert!(verify_signature(None, None, body));
        assert!(verify_signature(Some("secret"), Some(&sign("secret", body)), body));
        assert!(!verify_signature(Some("secret"), Some(&sign("other", body)), body));
        assert!(!verify_signature(Some("secret"), Some("sha256=zz"), body));
        assert!(!verify_signature(Some("secret"), None, body));
    }

    #[test]
    fn test_preview_text() {
        assert_eq!(preview_text("short"), "short");
        let long = "ა".repeat(40);
        let preview = preview_text(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(millis_to_iso(0), "1970-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_webhook_records_platform_messages_once() {
        let state = state_with(Config::default());
        let body = Bytes::from(page_payload().to_string());

        for _ in 0..2 {
            let response = messenger_webhook_event(State(state.clone()), HeaderMap::new(), body.clone())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let first = state.ledger.get_conversation("24680").await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "m.1");
        assert_eq!(first[0].meta.as_ref().unwrap()["source"], "messenger");
        let second = state.ledger.get_conversation("13579").await;
        assert_eq!(second.len(), 1);

        let sender = state.identities.get_identity("13579").await.unwrap();
        assert!(sender.is_external_platform_user);
    }

    #[tokio::test]
    async fn test_webhook_rejections() {
        let mut config = Config::default();
        config.messenger.app_secret = Some("secret".into());
        let state = state_with(config);

        let body = Bytes::from(page_payload().to_string());
        let unsigned = messenger_webhook_event(State(state.clone()), HeaderMap::new(), body.clone()).await;
        assert!(matches!(unsigned, Err(ApiError::BadSignature)));

        let other = Bytes::from(json!({ "object": "user" }).to_string());
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sign("secret", &other).parse().unwrap());
        let not_page = messenger_webhook_event(State(state.clone()), headers, other).await;
        assert!(matches!(not_page, Err(ApiError::NotPageEvent)));
        assert!(state.store.list_identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_verify_handshake() {
        let mut config = Config::default();
        config.messenger.verify_token = "tok".into();
        let state = state_with(config);

        let params = |token: &str| {
            HashMap::from([
                ("hub.mode".to_string(), "subscribe".to_string()),
                ("hub.verify_token".to_string(), token.to_string()),
                ("hub.challenge".to_string(), "42".to_string()),
            ])
        };
        let ok = messenger_webhook_verify(Query(params("tok")), State(state.clone())).await;
        assert_eq!(ok.status(), StatusCode::OK);
        let bad = messenger_webhook_verify(Query(params("nope")), State(state)).await;
        assert_eq!(bad.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_stats_counts_both_kinds() {
        let state = state_with(Config::default());
        let guest = state.identities.provision_guest("g1", None).await.unwrap();
        state.identities.resolve_platform_sender("24680", None).await.unwrap();
        state
            .ledger
            .record_incoming(&guest.id, &"x".repeat(45), None, None)
            .await
            .unwrap();
        state.ledger.record_operator_reply(&guest.id, "hi").await.unwrap();

        let Json(stats) = relay_stats(State(state)).await;
        assert_eq!(stats.backend, "memory");
        assert_eq!((stats.identities, stats.guests, stats.platform_users), (2, 1, 1));
        assert_eq!((stats.messages, stats.operator_messages, stats.visitor_messages), (2, 1, 1));
        assert_eq!(stats.recent.len(), 2);
        assert!(stats.recent.iter().any(|p| p.text.ends_with("...")));
    }
}
