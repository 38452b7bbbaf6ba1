#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests: the real router on a random port over an in-process
//! store, driven through WebSocket and HTTP clients.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use {
    beacon_config::GatewayConfig,
    beacon_gateway::{GatewayState, build_gateway_app},
    beacon_store::{DurableStore, MemoryStore},
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::net::TcpStream,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ORIGIN: &str = "http://localhost:3001";

struct TestGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    store: Arc<MemoryStore>,
    http: reqwest::Client,
}

impl TestGateway {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let state = GatewayState::new(store.clone(), GatewayConfig::default());
        state.spawn_background_tasks().await.unwrap();

        let app = build_gateway_app(Arc::clone(&state), &[ORIGIN.to_string()]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            store,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Open a session and wait until the gateway has registered it.
    async fn connect(&self, user_id: i64) -> Ws {
        let before = self.state.registry.sessions_for(user_id).await.len();
        let (ws, _) = connect_async(format!("ws://{}/ws?user_id={user_id}", self.addr))
            .await
            .unwrap();
        let registry = Arc::clone(&self.state.registry);
        wait_until(|| {
            let registry = Arc::clone(&registry);
            async move { registry.sessions_for(user_id).await.len() > before }
        })
        .await;
        ws
    }

    async fn send_test_message(&self, body: Value) -> reqwest::Response {
        self.http
            .post(self.url("/api/test/send"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Next JSON text frame, failing after a few seconds.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Next frame of the given `type`, skipping others.
async fn next_of_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// True if no text frame arrives within a short window.
async fn stays_quiet(ws: &mut Ws) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_millis(200), ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Text(_)))) => return false,
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return true,
        }
    }
}

async fn send_json(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

// ── Connect validation ───────────────────────────────────────────────────────

#[tokio::test]
async fn connect_without_valid_user_id_is_rejected() {
    let gw = TestGateway::start().await;

    for path in ["/ws", "/ws?user_id=", "/ws?user_id=abc", "/ws?user_id=1.5"] {
        let resp = gw.http.get(gw.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), 400, "{path}");
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("user_id"));
    }

    let err = connect_async(format!("ws://{}/ws?user_id=nope", gw.addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 400),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gw.state.registry.session_count().await, 0);
}

// ── Delivery ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn offline_message_is_queued_then_delivered_on_connect() {
    let gw = TestGateway::start().await;

    let resp = gw
        .send_test_message(json!({
            "message_id": "m-1",
            "user_id": 1,
            "recipient_id": 2,
            "conversation_id": 5,
            "content": "are you there?",
        }))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "published");
    assert_eq!(body["message_id"], "m-1");
    assert_eq!(body["recipient"], 2);

    let pending = Arc::clone(&gw.state.pending);
    wait_until(|| {
        let pending = Arc::clone(&pending);
        async move { pending.count(2).await.unwrap() == 1 }
    })
    .await;

    let listed: Value = gw
        .http
        .get(gw.url("/api/pending?user_id=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["user_id"], 2);
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["messages"][0]["content"], "are you there?");

    let mut ws = gw.connect(2).await;
    let delivered = next_of_type(&mut ws, "message").await;
    assert_eq!(delivered["message_id"], "m-1");
    assert_eq!(delivered["user_id"], 1);
    assert_eq!(gw.state.pending.count(2).await.unwrap(), 0);
}

#[tokio::test]
async fn live_message_reaches_every_session_with_extra_fields() {
    let gw = TestGateway::start().await;
    let mut first = gw.connect(2).await;
    let mut second = gw.connect(2).await;

    gw.send_test_message(json!({
        "user_id": 1,
        "recipient_id": 2,
        "conversation_id": 9,
        "content": "is it still available?",
        "listing": { "id": 77, "title": "Bike" },
    }))
    .await;

    for ws in [&mut first, &mut second] {
        let got = next_of_type(ws, "message").await;
        assert!(got["message_id"].as_str().unwrap().starts_with("msg_"));
        assert_eq!(got["listing"]["title"], "Bike");
    }
    assert_eq!(gw.state.pending.count(2).await.unwrap(), 0);
}

#[tokio::test]
async fn test_send_requires_sender_and_recipient() {
    let gw = TestGateway::start().await;

    let resp = gw.send_test_message(json!({ "user_id": 1, "content": "x" })).await;
    assert_eq!(resp.status(), 400);

    let resp = gw
        .http
        .post(gw.url("/api/test/send"))
        .body("{broken")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

// ── Presence and ephemeral events ────────────────────────────────────────────

#[tokio::test]
async fn presence_transitions_and_snapshot() {
    let gw = TestGateway::start().await;
    let mut b = gw.connect(2).await;
    let mut a = gw.connect(1).await;

    let online = next_of_type(&mut b, "user_status").await;
    assert_eq!(online, json!({ "type": "user_status", "user_id": 1, "online": true }));
    let snapshot = next_of_type(&mut a, "user_status").await;
    assert_eq!(snapshot, json!({ "type": "user_status", "user_id": 2, "online": true }));
    assert_eq!(gw.store.get("user:1:status").await.unwrap().as_deref(), Some("online"));

    // A second session for the same user is not a transition.
    let mut a2 = gw.connect(1).await;
    next_of_type(&mut a2, "user_status").await;
    a2.close(None).await.unwrap();
    let registry = Arc::clone(&gw.state.registry);
    wait_until(|| {
        let registry = Arc::clone(&registry);
        async move { registry.sessions_for(1).await.len() == 1 }
    })
    .await;
    assert!(stays_quiet(&mut b).await);

    a.close(None).await.unwrap();
    let offline = next_of_type(&mut b, "user_status").await;
    assert_eq!(offline, json!({ "type": "user_status", "user_id": 1, "online": false }));

    let store = Arc::clone(&gw.store);
    wait_until(|| {
        let store = Arc::clone(&store);
        async move { store.get("user:1:status").await.unwrap().as_deref() == Some("offline") }
    })
    .await;
}

#[tokio::test]
async fn typing_is_relayed_without_touching_pending() {
    let gw = TestGateway::start().await;
    let mut b = gw.connect(2).await;
    let mut a = gw.connect(1).await;
    next_of_type(&mut b, "user_status").await;

    let typing = json!({ "type": "typing", "recipient_id": 2, "conversation_id": 5 });
    send_json(&mut a, typing.clone()).await;

    assert_eq!(next_of_type(&mut b, "typing").await, typing);
    assert!(gw.store.keys("pending:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn read_receipt_goes_to_other_users() {
    let gw = TestGateway::start().await;
    let mut b = gw.connect(2).await;
    let mut a = gw.connect(1).await;
    next_of_type(&mut b, "user_status").await;
    next_of_type(&mut a, "user_status").await;

    send_json(&mut a, json!({ "type": "read", "conversation_id": 5 })).await;

    let receipt = next_of_type(&mut b, "read_receipt").await;
    assert_eq!(receipt["user_id"], 1);
    assert_eq!(receipt["conversation_id"], 5);
    assert!(receipt["timestamp"].is_string());
    assert!(stays_quiet(&mut a).await);
}

#[tokio::test]
async fn ack_records_delivery_receipt() {
    let gw = TestGateway::start().await;
    let mut a = gw.connect(1).await;

    send_json(&mut a, json!({ "type": "ack", "message_id": "m-42" })).await;

    let store = Arc::clone(&gw.store);
    wait_until(|| {
        let store = Arc::clone(&store);
        async move { store.get("delivered:m-42:1").await.unwrap().is_some() }
    })
    .await;
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_and_online_report_registry_counts() {
    let gw = TestGateway::start().await;
    let _a1 = gw.connect(1).await;
    let _a2 = gw.connect(1).await;
    let _b = gw.connect(7).await;

    let health: Value = gw.http.get(gw.url("/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["total_connections"], 3);
    assert_eq!(health["unique_users"], 2);
    assert!(health["timestamp"].is_string());

    let online: Value = gw
        .http
        .get(gw.url("/api/online"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(online, json!({ "count": 2, "user_ids": [1, 7] }));
}

#[tokio::test]
async fn store_check_and_pending_validation() {
    let gw = TestGateway::start().await;

    let ping: Value = gw
        .http
        .get(gw.url("/api/test/store"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ping, json!({ "status": "ok", "ping": "PONG" }));

    let resp = gw.http.get(gw.url("/api/pending")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn cors_allows_configured_origin_with_credentials() {
    let gw = TestGateway::start().await;

    let resp = gw
        .http
        .request(reqwest::Method::OPTIONS, gw.url("/api/online"))
        .header("origin", ORIGIN)
        .header("access-control-request-method", "GET")
        .header("access-control-request-headers", "content-type")
        .send()
        .await
        .unwrap();
    let headers = resp.headers();
    assert_eq!(headers["access-control-allow-origin"], ORIGIN);
    assert_eq!(headers["access-control-allow-credentials"], "true");

    let resp = gw
        .http
        .get(gw.url("/api/online"))
        .header("origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}
