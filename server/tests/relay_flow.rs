use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_relay::{
    app,
    client::{DeliveryStatus, SyncClient, SyncPhase},
    clock::SystemClock,
    config::Config,
    relay::{self, RelayError, RelayTask, Transport},
    store::MemoryStore,
    types::AppState,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

struct RecordingTransport(mpsc::UnboundedSender<RelayTask>);

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, task: &RelayTask) -> Result<(), RelayError> {
        let _ = self.0.send(task.clone());
        Ok(())
    }
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<RelayTask>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (outbox, _worker) = relay::spawn(Arc::new(RecordingTransport(tx)));
    let state = Arc::new(AppState::new(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Some(outbox),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app::router(state)).await.unwrap();
    });
    (format!("http://{addr}"), rx)
}

async fn operator_reply(http: &reqwest::Client, base: &str, identity_id: &str, text: &str) -> (u16, Value) {
    let response = http
        .post(format!("{base}/api/operator/reply"))
        .json(&json!({ "identityId": identity_id, "text": text }))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn operator_poll(http: &reqwest::Client, base: &str, identity_id: &str, since: i64) -> Vec<Value> {
    let since = since.to_string();
    let body: Value = http
        .get(format!("{base}/api/operator/poll"))
        .query(&[("identityId", identity_id), ("lastTimestamp", since.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["messages"].as_array().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_guest_round_trip() {
    let (base, _relayed) = spawn_server().await;
    let http = reqwest::Client::new();
    let client = SyncClient::new(&base);

    let session = client.provision(Some("user_g1"), Some("Nino")).await.unwrap();
    assert_eq!(session.identity_id, "guest_g1");
    assert_eq!(session.display_name.as_deref(), Some("Nino"));
    assert_eq!(client.session().phase(), SyncPhase::Identified);
    assert_eq!(client.session().poll_interval(), Duration::from_secs(15));

    let sent = client.send("hello").await.unwrap();
    assert!(sent.accepted);
    assert!(!sent.is_duplicate);
    assert_eq!(sent.canonical_identity_id, "guest_g1");

    // double-fire with a fresh client id lands inside the text window
    let again = client.send("hello").await.unwrap();
    assert!(again.is_duplicate);
    assert_eq!(again.message_id, sent.message_id);
    assert!(client
        .session()
        .outgoing()
        .iter()
        .all(|o| o.status == DeliveryStatus::Confirmed));

    let (status, reply) = operator_reply(&http, &base, "guest_g1", "hi").await;
    assert_eq!(status, 200);
    assert_eq!(reply["deliveredToGuest"], true);
    assert_eq!(reply["relayQueued"], false);

    // our own message confirms the outgoing entry, only the reply is new
    let fresh = client.poll_once().await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].text, "hi");
    assert!(fresh[0].from_operator);
    assert_eq!(client.session().messages().len(), 2);
    assert_eq!(client.session().watermark(), fresh[0].sent_at);

    assert!(client.poll_once().await.unwrap().is_empty());

    // the operator console consumes independently of the widget
    assert_eq!(operator_poll(&http, &base, "guest_g1", 0).await.len(), 2);
    assert!(operator_poll(&http, &base, "guest_g1", 0).await.is_empty());

    let conversation: Value = http
        .get(format!("{base}/api/operator/identities/guest_g1/messages"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let texts = conversation["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["hello", "hi"]);
}

#[tokio::test]
async fn test_platform_reply_is_relayed() {
    let (base, mut relayed) = spawn_server().await;
    let http = reqwest::Client::new();

    let event = json!({
        "object": "page",
        "entry": [{
            "messaging": [{
                "sender": { "id": "24680" },
                "message": { "mid": "m.1", "text": "is anyone there?" }
            }]
        }]
    });
    for _ in 0..2 {
        let response = http
            .post(format!("{base}/api/messenger/webhook"))
            .json(&event)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "EVENT_RECEIVED");
    }

    let identities: Value = http
        .get(format!("{base}/api/operator/identities"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(identities["count"], 1);
    assert_eq!(identities["identities"][0]["isExternalPlatformUser"], true);
    assert_eq!(operator_poll(&http, &base, "24680", 0).await.len(), 1);

    let (status, reply) = operator_reply(&http, &base, "24680", "yes, hello").await;
    assert_eq!(status, 200);
    assert_eq!(reply["externalPlatformUser"], true);
    assert_eq!(reply["relayQueued"], true);

    let task = tokio::time::timeout(Duration::from_secs(2), relayed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.recipient_id, "24680");
    assert_eq!(task.text, "yes, hello");
    assert_eq!(Some(task.message_id.as_str()), reply["messageId"].as_str());

    let stats: Value = http
        .get(format!("{base}/api/operator/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["platformUsers"], 1);
    assert_eq!(stats["messages"], 2);
}

#[tokio::test]
async fn test_validation_errors() {
    let (base, _relayed) = spawn_server().await;
    let http = reqwest::Client::new();

    let empty = http
        .post(format!("{base}/api/widget/message"))
        .json(&json!({ "identityToken": "g1", "text": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status().as_u16(), 400);

    let (status, body) = operator_reply(&http, &base, "guest_nobody", "hi").await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("guest_nobody"));

    let missing = http
        .get(format!("{base}/api/widget/poll"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 400);

    let bad_verify = http
        .get(format!("{base}/api/messenger/webhook"))
        .query(&[("hub.mode", "subscribe"), ("hub.verify_token", "x"), ("hub.challenge", "1")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad_verify.status().as_u16(), 403);
}

#[tokio::test]
async fn test_poll_loop_stops_on_shutdown() {
    let (base, _relayed) = spawn_server().await;
    let client = SyncClient::new(&base);
    client.provision(None, None).await.unwrap();
    let identity_id = client.session().identity_id().unwrap().to_string();
    assert!(identity_id.starts_with("guest_"));

    let http = reqwest::Client::new();
    operator_reply(&http, &base, &identity_id, "welcome").await;

    let (stop, stopped) = watch::channel(false);
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run(Duration::from_millis(50), stopped).await })
    };

    // the immediate first tick picks up the reply
    let mut seen = false;
    for _ in 0..40 {
        if client.session().messages().len() == 1 {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(seen);
    assert_eq!(client.session().phase(), SyncPhase::Polling);

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
