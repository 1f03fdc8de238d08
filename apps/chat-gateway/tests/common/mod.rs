#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use chat_gateway::auth::tokens::mint_access_token;
use chat_gateway::auth::JwtValidator;
use chat_gateway::config::{BrokerBackend, Config};
use chat_gateway::directory::MemoryDirectory;
use chat_gateway::gateway::fanout::RoomBroker;
use chat_gateway::gateway::registry::RoomRegistry;
use chat_gateway::gateway::supervisor::Supervisor;
use chat_gateway::gateway::Gateway;
use chat_gateway::models::{RoomId, StoredMessage, UserIdentity};
use chat_gateway::store::{Cursor, MemoryMessageStore, MessageStore, Page, StoreError};
use chat_gateway::AppState;

pub const SIGNING_KEY: &str = "test-signing-key";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Memory store that can be told to fail or slow down its appends.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryMessageStore,
    failures: AtomicUsize,
    append_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn fail_next(&self, appends: usize) {
        self.failures.store(appends, Ordering::SeqCst);
    }

    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn append(
        &self,
        room: &RoomId,
        sender: &UserIdentity,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.append(room, sender, text).await
    }

    async fn page(
        &self,
        room: &RoomId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        self.inner.page(room, cursor, limit).await
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub directory: Arc<MemoryDirectory>,
    pub store: Arc<FlakyStore>,
    pub broker: Arc<RoomRegistry>,
}

impl TestEnv {
    pub fn members(&self, room: &str) -> usize {
        self.broker.member_count(&RoomId::from(room))
    }

    pub fn broker_rooms(&self) -> usize {
        self.broker.room_count()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.state.supervisor
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused/chat_test".to_string(),
        jwt_signing_key: SIGNING_KEY.to_string(),
        port: 0,
        broker: BrokerBackend::InProcess,
        max_connections: None,
        outbound_buffer: 256,
        history_page_size: 50,
        ping_interval_secs: 30,
        shutdown_grace_secs: 1,
    }
}

/// Users alice (1), bob (2), carol (3) and mallory (4); rooms "7" and "8";
/// mallory is denied room "7".
pub fn test_env_with(config: Config) -> TestEnv {
    let directory = Arc::new(MemoryDirectory::new());
    directory.add_user(1, "alice");
    directory.add_user(2, "bob");
    directory.add_user(3, "carol");
    directory.add_user(4, "mallory");
    directory.add_room("7");
    directory.add_room("8");
    directory.deny(4, "7");

    let store = Arc::new(FlakyStore::default());
    let broker = Arc::new(RoomRegistry::new());
    let validator = Arc::new(JwtValidator::new(
        config.jwt_signing_key.as_bytes(),
        directory.clone(),
    ));

    let gateway = Gateway::new(validator, directory.clone(), store.clone(), broker.clone())
        .with_outbound_buffer(config.outbound_buffer);
    let supervisor = Arc::new(Supervisor::new(config.max_connections));

    let state = AppState {
        config: Arc::new(config),
        gateway,
        supervisor,
    };

    TestEnv {
        state,
        directory,
        store,
        broker,
    }
}

pub fn test_env() -> TestEnv {
    test_env_with(test_config())
}

pub fn test_app(env: &TestEnv) -> Router {
    chat_gateway::routes::router().with_state(env.state.clone())
}

/// Start an actual TCP server for WebSocket testing.
pub async fn start_ws_server(env: &TestEnv) -> SocketAddr {
    let app = test_app(env);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

pub fn token_for(user_id: i64) -> String {
    mint_access_token(
        SIGNING_KEY.as_bytes(),
        user_id,
        chrono::Duration::minutes(5),
    )
    .expect("mint token")
}

pub fn expired_token_for(user_id: i64) -> String {
    mint_access_token(
        SIGNING_KEY.as_bytes(),
        user_id,
        chrono::Duration::minutes(-5),
    )
    .expect("mint token")
}

pub async fn connect(addr: SocketAddr, room: &str, token: Option<&str>) -> WsClient {
    match token {
        Some(token) => connect_with_query(addr, room, &format!("token={token}")).await,
        None => connect_url(&format!("ws://{addr}/ws/chat/{room}")).await,
    }
}

pub async fn connect_with_query(addr: SocketAddr, room: &str, query: &str) -> WsClient {
    connect_url(&format!("ws://{addr}/ws/chat/{room}?{query}")).await
}

async fn connect_url(url: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");
    ws
}

/// Connect as `user_id` and wait until the room reports `expected_members`.
pub async fn join(
    env: &TestEnv,
    addr: SocketAddr,
    room: &str,
    user_id: i64,
    expected_members: usize,
) -> WsClient {
    let ws = connect(addr, room, Some(&token_for(user_id))).await;
    wait_until(|| env.members(room) == expected_members).await;
    ws
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn chat_frame(text: &str) -> tungstenite::Message {
    tungstenite::Message::Text(
        serde_json::json!({ "type": "chat.message", "text": text })
            .to_string()
            .into(),
    )
}

/// Next text frame as JSON, skipping control frames.
pub async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("parse frame")
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn recv_close_code(ws: &mut WsClient) -> Option<u16> {
    loop {
        let next = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");

        match next {
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return frame.map(|f| u16::from(f.code))
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Assert nothing but control frames arrive within `window`.
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let quiet = time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Ping(_))) | Some(Ok(tungstenite::Message::Pong(_))) => {
                    continue
                }
                other => return other,
            }
        }
    })
    .await;
    if let Ok(frame) = quiet {
        panic!("expected silence, got {frame:?}");
    }
}
